use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DocumentSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderMode {
    Single,
    #[default]
    Continuous,
}

impl RenderMode {
    pub fn toggled(self) -> Self {
        match self {
            RenderMode::Single => RenderMode::Continuous,
            RenderMode::Continuous => RenderMode::Single,
        }
    }
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(RenderMode::Single),
            "continuous" => Ok(RenderMode::Continuous),
            other => Err(format!("unknown render mode `{other}`")),
        }
    }
}

/// Named scaling strategy the engine turns into a scale factor from the
/// container and page dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ZoomFit {
    #[serde(rename = "page-fit")]
    PageFit,
    #[default]
    #[serde(rename = "page-width")]
    PageWidth,
}

impl ZoomFit {
    pub fn as_str(self) -> &'static str {
        match self {
            ZoomFit::PageFit => "page-fit",
            ZoomFit::PageWidth => "page-width",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            ZoomFit::PageFit => ZoomFit::PageWidth,
            ZoomFit::PageWidth => ZoomFit::PageFit,
        }
    }
}

impl FromStr for ZoomFit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page-fit" => Ok(ZoomFit::PageFit),
            "page-width" => Ok(ZoomFit::PageWidth),
            other => Err(format!("unknown zoom fit `{other}`")),
        }
    }
}

/// Zoom multiplier as the caller hands it over: a numeric string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoomFactor(String);

/// Zoom steps offered by hosts that step through zoom levels.
pub const ZOOM_STEPS: [&str; 8] = ["0.5", "0.75", "1", "1.25", "1.5", "2", "3", "4"];

impl ZoomFactor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The parsed multiplier. Anything that is not a finite positive number
    /// yields `1.0`.
    pub fn multiplier(&self) -> f32 {
        match self.0.trim().parse::<f32>() {
            Ok(value) if value.is_finite() && value > 0.0 => value,
            _ => 1.0,
        }
    }

    /// The next entry of [`ZOOM_STEPS`] above (`direction > 0`) or below the
    /// current multiplier, saturating at both ends.
    pub fn stepped(&self, direction: i32) -> Self {
        let current = self.multiplier();
        let step = if direction > 0 {
            ZOOM_STEPS
                .iter()
                .find(|step| parse_step(step) > current + f32::EPSILON)
                .or(ZOOM_STEPS.last())
        } else {
            ZOOM_STEPS
                .iter()
                .rev()
                .find(|step| parse_step(step) < current - f32::EPSILON)
                .or(ZOOM_STEPS.first())
        };
        step.map(|step| Self::new(*step)).unwrap_or_default()
    }
}

fn parse_step(step: &str) -> f32 {
    step.parse().unwrap_or(1.0)
}

impl Default for ZoomFactor {
    fn default() -> Self {
        Self("1".to_owned())
    }
}

impl fmt::Display for ZoomFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ZoomFactor {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// Every declarative input of the viewport controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerProps {
    pub source: Option<DocumentSource>,
    pub page: Option<usize>,
    pub rotation: Option<i32>,
    pub render_mode: RenderMode,
    pub selectable: bool,
    pub search: String,
    pub zoom: ZoomFactor,
    pub zoom_fit: ZoomFit,
}

impl Default for ViewerProps {
    fn default() -> Self {
        Self {
            source: None,
            page: None,
            rotation: None,
            render_mode: RenderMode::default(),
            selectable: true,
            search: String::new(),
            zoom: ZoomFactor::default(),
            zoom_fit: ZoomFit::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ViewerInput {
    SetSource(Option<DocumentSource>),
    SetPage(Option<usize>),
    SetRotation(Option<i32>),
    SetRenderMode(RenderMode),
    SetSelectable(bool),
    SetSearch(String),
    SetZoom(ZoomFactor),
    SetZoomFit(ZoomFit),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_multiplier_falls_back_to_one() {
        assert_eq!(ZoomFactor::new("2").multiplier(), 2.0);
        assert_eq!(ZoomFactor::new(" 1.5 ").multiplier(), 1.5);
        assert_eq!(ZoomFactor::new("abc").multiplier(), 1.0);
        assert_eq!(ZoomFactor::new("-3").multiplier(), 1.0);
        assert_eq!(ZoomFactor::new("0").multiplier(), 1.0);
        assert_eq!(ZoomFactor::new("inf").multiplier(), 1.0);
        assert_eq!(ZoomFactor::new("NaN").multiplier(), 1.0);
    }

    #[test]
    fn zoom_steps_saturate_at_bounds() {
        assert_eq!(ZoomFactor::new("1").stepped(1).as_str(), "1.25");
        assert_eq!(ZoomFactor::new("1").stepped(-1).as_str(), "0.75");
        assert_eq!(ZoomFactor::new("4").stepped(1).as_str(), "4");
        assert_eq!(ZoomFactor::new("0.5").stepped(-1).as_str(), "0.5");
        assert_eq!(ZoomFactor::new("1.1").stepped(1).as_str(), "1.25");
    }

    #[test]
    fn zoom_fit_round_trips_names() {
        assert_eq!("page-fit".parse::<ZoomFit>(), Ok(ZoomFit::PageFit));
        assert_eq!(ZoomFit::PageWidth.as_str(), "page-width");
        assert!("fit".parse::<ZoomFit>().is_err());
        assert_eq!("single".parse::<RenderMode>(), Ok(RenderMode::Single));
        assert!("scroll".parse::<RenderMode>().is_err());
    }

    #[test]
    fn props_defaults_match_inputs() {
        let props = ViewerProps::default();
        assert!(props.selectable);
        assert_eq!(props.zoom.as_str(), "1");
        assert_eq!(props.zoom_fit, ZoomFit::PageWidth);
        assert_eq!(props.render_mode, RenderMode::Continuous);
        assert!(props.search.is_empty());
    }
}
