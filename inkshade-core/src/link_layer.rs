use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geometry::Rect;
use crate::DocumentBackend;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkDestination {
    pub page: usize,
    pub x: f32,
    pub y: f32,
    pub zoom: Option<f32>,
}

impl LinkDestination {
    pub fn page(page: usize) -> Self {
        Self {
            page,
            x: 0.0,
            y: 0.0,
            zoom: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkAction {
    GoTo { destination: LinkDestination },
    GoToRemote { file: String, destination: Option<LinkDestination> },
    Uri { uri: String },
    Launch { file: String },
    Named { name: String, destination: Option<LinkDestination> },
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    GoTo,
    GoToRemote,
    Uri,
    Launch,
    Named,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDefinition {
    pub bbox: Rect,
    pub action: LinkAction,
}

impl LinkDefinition {
    pub fn kind(&self) -> LinkKind {
        match self.action {
            LinkAction::GoTo { .. } => LinkKind::GoTo,
            LinkAction::GoToRemote { .. } => LinkKind::GoToRemote,
            LinkAction::Uri { .. } => LinkKind::Uri,
            LinkAction::Launch { .. } => LinkKind::Launch,
            LinkAction::Named { .. } => LinkKind::Named,
            LinkAction::Unknown => LinkKind::Unknown,
        }
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        self.bbox.contains(x, y)
    }

    /// In-document target, if following the link stays in this document.
    pub fn internal_destination(&self) -> Option<LinkDestination> {
        match &self.action {
            LinkAction::GoTo { destination } => Some(*destination),
            LinkAction::Named { destination, .. } => *destination,
            _ => None,
        }
    }

    pub fn display_text(&self) -> String {
        match &self.action {
            LinkAction::Uri { uri } if !uri.is_empty() => uri.clone(),
            LinkAction::Uri { .. } => "External Link".to_string(),
            LinkAction::GoTo { destination } => format!("Go to page {}", destination.page + 1),
            LinkAction::Named { name, .. } if !name.is_empty() => format!("#{name}"),
            LinkAction::Named { .. } => "Named Link".to_string(),
            LinkAction::Launch { file } if !file.is_empty() => file.clone(),
            LinkAction::Launch { .. } => "Open File".to_string(),
            LinkAction::GoToRemote { .. } | LinkAction::Unknown => "Link".to_string(),
        }
    }
}

/// Clickable regions of one page. Links later in the list are drawn on top.
#[derive(Debug, Clone, Default)]
pub struct LinkLayer {
    links: Vec<LinkDefinition>,
}

impl LinkLayer {
    pub fn new(links: Vec<LinkDefinition>) -> Self {
        Self { links }
    }

    pub fn from_backend(backend: &dyn DocumentBackend, page_index: usize) -> Self {
        match backend.page_links(page_index) {
            Ok(links) => Self::new(links),
            Err(err) => {
                warn!(?err, page = page_index, "link extraction failed; using empty layer");
                Self::default()
            }
        }
    }

    pub fn links(&self) -> &[LinkDefinition] {
        &self.links
    }

    /// Topmost link containing the point.
    pub fn link_at(&self, x: f32, y: f32) -> Option<&LinkDefinition> {
        self.links.iter().rev().find(|link| link.contains_point(x, y))
    }

    pub fn links_at(&self, x: f32, y: f32) -> Vec<&LinkDefinition> {
        self.links
            .iter()
            .filter(|link| link.contains_point(x, y))
            .collect()
    }

    pub fn links_in_rect(&self, rect: Rect) -> Vec<&LinkDefinition> {
        let rect = rect.normalized();
        self.links
            .iter()
            .filter(|link| link.bbox.intersects(&rect))
            .collect()
    }

    pub fn of_kind(&self, kind: LinkKind) -> Vec<&LinkDefinition> {
        self.links.iter().filter(|link| link.kind() == kind).collect()
    }

    pub fn internal_links(&self) -> Vec<&LinkDefinition> {
        self.links
            .iter()
            .filter(|link| matches!(link.kind(), LinkKind::GoTo | LinkKind::Named))
            .collect()
    }

    pub fn external_links(&self) -> Vec<&LinkDefinition> {
        self.of_kind(LinkKind::Uri)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(bbox: Rect, uri: &str) -> LinkDefinition {
        LinkDefinition {
            bbox,
            action: LinkAction::Uri {
                uri: uri.to_string(),
            },
        }
    }

    #[test]
    fn topmost_link_wins() {
        let layer = LinkLayer::new(vec![
            uri(Rect::new(0.0, 0.0, 50.0, 50.0), "https://below.example"),
            uri(Rect::new(10.0, 10.0, 20.0, 20.0), "https://above.example"),
        ]);
        let hit = layer.link_at(15.0, 15.0).unwrap();
        assert_eq!(hit.display_text(), "https://above.example");
        assert_eq!(layer.links_at(15.0, 15.0).len(), 2);
        assert_eq!(
            layer.link_at(40.0, 40.0).unwrap().display_text(),
            "https://below.example"
        );
        assert!(layer.link_at(60.0, 60.0).is_none());
    }

    #[test]
    fn classifies_internal_and_external_links() {
        let layer = LinkLayer::new(vec![
            uri(Rect::new(0.0, 0.0, 5.0, 5.0), "https://example.com"),
            LinkDefinition {
                bbox: Rect::new(0.0, 10.0, 5.0, 15.0),
                action: LinkAction::GoTo {
                    destination: LinkDestination::page(4),
                },
            },
            LinkDefinition {
                bbox: Rect::new(0.0, 20.0, 5.0, 25.0),
                action: LinkAction::Named {
                    name: "chapter".to_string(),
                    destination: None,
                },
            },
        ]);
        assert_eq!(layer.external_links().len(), 1);
        assert_eq!(layer.internal_links().len(), 2);
        assert_eq!(layer.links()[1].display_text(), "Go to page 5");
        assert_eq!(layer.links()[1].internal_destination().map(|d| d.page), Some(4));
        assert_eq!(layer.links()[2].display_text(), "#chapter");
        assert_eq!(layer.links_in_rect(Rect::new(0.0, 8.0, 10.0, 30.0)).len(), 2);
    }
}
