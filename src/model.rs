//! Core data model: pages, components and their structural analysis.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One scanned page in the input sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// Stable identifier: the image's file name, e.g. `page-004.jpg`.
    pub id: String,
    /// Full path to the image file.
    pub path: PathBuf,
    /// 0-based position in the sorted page sequence.
    pub position: usize,
}

impl PageImage {
    /// File name without extension, used to derive every per-page artefact
    /// name (Markdown output, cache entries, figure directory).
    pub fn stem(&self) -> &str {
        page_stem(&self.id)
    }
}

/// Strip the extension from a page identifier.
pub fn page_stem(id: &str) -> &str {
    Path::new(id)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(id)
}

/// Semantic type of a page region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    TextBlock,
    FormulaBlock,
    Figure,
    Caption,
    Header,
    Footer,
}

impl ComponentType {
    /// Parse the backend's type label. Unknown labels yield `None`.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "text_block" | "text" | "paragraph" => Some(Self::TextBlock),
            "formula_block" | "formula" | "equation" => Some(Self::FormulaBlock),
            "figure" | "image" | "diagram" => Some(Self::Figure),
            "caption" => Some(Self::Caption),
            "header" => Some(Self::Header),
            "footer" => Some(Self::Footer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextBlock => "text_block",
            Self::FormulaBlock => "formula_block",
            Self::Figure => "figure",
            Self::Caption => "caption",
            Self::Header => "header",
            Self::Footer => "footer",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned region in page pixel coordinates.
///
/// Only constructed through [`BoundingBox::validate`], so every instance
/// satisfies `x_min < x_max`, `y_min < y_max` and lies inside its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "[u32; 4]", try_from = "[u32; 4]")]
pub struct BoundingBox {
    x_min: u32,
    y_min: u32,
    x_max: u32,
    y_max: u32,
}

/// Why a raw box was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum BoxRejection {
    WrongArity(usize),
    NotFinite,
    Inverted,
    OutOfBounds { width: u32, height: u32 },
}

impl fmt::Display for BoxRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoxRejection::WrongArity(n) => write!(f, "expected 4 coordinates, got {n}"),
            BoxRejection::NotFinite => f.write_str("coordinates must be finite numbers"),
            BoxRejection::Inverted => f.write_str("requires x_min < x_max and y_min < y_max"),
            BoxRejection::OutOfBounds { width, height } => {
                write!(f, "outside the {width}x{height} page")
            }
        }
    }
}

impl BoundingBox {
    /// Validate raw `[x_min, y_min, x_max, y_max]` coordinates against a
    /// `width × height` page. Fractional coordinates are rounded.
    pub fn validate(coords: &[f64], width: u32, height: u32) -> Result<Self, BoxRejection> {
        let [x0, y0, x1, y1] = match coords {
            [a, b, c, d] => [*a, *b, *c, *d],
            other => return Err(BoxRejection::WrongArity(other.len())),
        };
        if ![x0, y0, x1, y1].iter().all(|v| v.is_finite()) {
            return Err(BoxRejection::NotFinite);
        }
        if x0 >= x1 || y0 >= y1 {
            return Err(BoxRejection::Inverted);
        }
        let (x0, y0, x1, y1) = (x0.round(), y0.round(), x1.round(), y1.round());
        if x0 < 0.0 || y0 < 0.0 || x1 > f64::from(width) || y1 > f64::from(height) {
            return Err(BoxRejection::OutOfBounds { width, height });
        }
        // Rounding can collapse a sub-pixel box.
        if x0 >= x1 || y0 >= y1 {
            return Err(BoxRejection::Inverted);
        }
        Ok(Self {
            x_min: x0 as u32,
            y_min: y0 as u32,
            x_max: x1 as u32,
            y_max: y1 as u32,
        })
    }

    pub fn x_min(&self) -> u32 {
        self.x_min
    }

    pub fn y_min(&self) -> u32 {
        self.y_min
    }

    pub fn width(&self) -> u32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> u32 {
        self.y_max - self.y_min
    }

    pub fn to_array(self) -> [u32; 4] {
        [self.x_min, self.y_min, self.x_max, self.y_max]
    }
}

impl From<BoundingBox> for [u32; 4] {
    fn from(b: BoundingBox) -> Self {
        b.to_array()
    }
}

impl TryFrom<[u32; 4]> for BoundingBox {
    type Error = String;

    fn try_from(c: [u32; 4]) -> Result<Self, Self::Error> {
        if c[0] >= c[2] || c[1] >= c[3] {
            return Err(BoxRejection::Inverted.to_string());
        }
        Ok(Self {
            x_min: c[0],
            y_min: c[1],
            x_max: c[2],
            y_max: c[3],
        })
    }
}

/// Identifier of a component within its page, e.g. `comp_03`.
pub type ComponentId = String;

/// Build the component id for a 1-based position in the raw payload.
pub fn component_id(position: usize) -> ComponentId {
    format!("comp_{position:02}")
}

/// A typed, bounded region of one page together with its transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    #[serde(rename = "type")]
    pub kind: ComponentType,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    /// Transcribed text/LaTeX, or a Markdown image link for figures.
    /// Empty until the component has been transcribed.
    pub content: String,
}

/// Reading-direction hint handed to the reassembly step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingDirection {
    /// Left-to-right lines, top-to-bottom.
    #[serde(rename = "LRTB")]
    LeftToRightTopToBottom,
    /// Top-to-bottom columns, right-to-left (vertical CJK typesetting).
    #[serde(rename = "TBRL")]
    TopToBottomRightToLeft,
}

impl ReadingDirection {
    pub fn for_language(language: &str) -> Self {
        match language.trim().to_ascii_lowercase().as_str() {
            "japanese" | "chinese" | "ja" | "zh" | "jpn" | "zho" => Self::TopToBottomRightToLeft,
            _ => Self::LeftToRightTopToBottom,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::LeftToRightTopToBottom => "LRTB",
            Self::TopToBottomRightToLeft => "TBRL",
        }
    }
}

/// Structural decomposition of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageAnalysis {
    pub page: String,
    pub language: String,
    pub reading_direction: ReadingDirection,
    pub components: Vec<Component>,
}

impl PageAnalysis {
    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_box_is_rejected() {
        let err = BoundingBox::validate(&[10.0, 10.0, 5.0, 20.0], 100, 100).unwrap_err();
        assert_eq!(err, BoxRejection::Inverted);
    }

    #[test]
    fn well_formed_box_is_accepted() {
        let b = BoundingBox::validate(&[10.0, 10.0, 20.0, 30.0], 100, 100).unwrap();
        assert_eq!(b.to_array(), [10, 10, 20, 30]);
        assert_eq!(b.width(), 10);
        assert_eq!(b.height(), 20);
    }

    #[test]
    fn box_arity_and_extent_checked() {
        assert_eq!(
            BoundingBox::validate(&[1.0, 2.0, 3.0], 100, 100),
            Err(BoxRejection::WrongArity(3))
        );
        assert!(matches!(
            BoundingBox::validate(&[0.0, 0.0, 101.0, 50.0], 100, 100),
            Err(BoxRejection::OutOfBounds { .. })
        ));
        assert!(matches!(
            BoundingBox::validate(&[-1.0, 0.0, 10.0, 10.0], 100, 100),
            Err(BoxRejection::OutOfBounds { .. })
        ));
        assert_eq!(
            BoundingBox::validate(&[0.0, f64::NAN, 10.0, 10.0], 100, 100),
            Err(BoxRejection::NotFinite)
        );
    }

    #[test]
    fn box_serialises_as_array() {
        let b = BoundingBox::validate(&[1.0, 2.0, 3.0, 4.0], 10, 10).unwrap();
        assert_eq!(serde_json::to_string(&b).unwrap(), "[1,2,3,4]");
        let back: BoundingBox = serde_json::from_str("[1,2,3,4]").unwrap();
        assert_eq!(back, b);
        assert!(serde_json::from_str::<BoundingBox>("[3,2,1,4]").is_err());
    }

    #[test]
    fn component_type_labels() {
        assert_eq!(ComponentType::parse("formula_block"), Some(ComponentType::FormulaBlock));
        assert_eq!(ComponentType::parse(" Figure "), Some(ComponentType::Figure));
        assert_eq!(ComponentType::parse("sidebar"), None);
        assert_eq!(ComponentType::Caption.to_string(), "caption");
    }

    #[test]
    fn reading_direction_from_language() {
        assert_eq!(
            ReadingDirection::for_language("Japanese"),
            ReadingDirection::TopToBottomRightToLeft
        );
        assert_eq!(
            ReadingDirection::for_language("english"),
            ReadingDirection::LeftToRightTopToBottom
        );
        assert_eq!(ReadingDirection::for_language("unknown").tag(), "LRTB");
    }

    #[test]
    fn ids_and_stems() {
        assert_eq!(component_id(2), "comp_02");
        assert_eq!(component_id(12), "comp_12");
        assert_eq!(page_stem("page-004.jpg"), "page-004");
    }
}
