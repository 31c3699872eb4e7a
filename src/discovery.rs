/*!
 # Timer discovery

 Locating the timer is an ordered list of strategies, each returning an
 optional match; the first hit wins. Strategy failures (unknown ids, bad
 selectors) only ever mean "try the next tier".
*/

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, trace};

use crate::color::ColorValue;
use crate::dom::{Document, NodeId};
use crate::monitor::MonitorConfig;

static TIME_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:\d{1,2}:)?\d{1,2}:\d{2}(?:\.\d{1,3})?|\d+\.\d+)$").unwrap()
});

/// Whether trimmed text reads like a timer display.
///
/// Accepts `M:SS`, `MM:SS`, `H:MM:SS`, an optional `.ms` suffix, and bare
/// decimal seconds such as `12.5`.
pub fn is_time_format(text: &str) -> bool {
    TIME_FORMAT.is_match(text.trim())
}

/// Which tier produced the binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOrigin {
    KnownId,
    Selector,
    TextWalk,
}

/// The nodes backing the timer display.
///
/// Replaced wholesale on rebind, never edited in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionTarget {
    /// Node whose text is the displayed value
    pub value_node: NodeId,
    /// Element whose background carries the state color
    pub color_node: NodeId,
    pub origin: BindOrigin,
}

pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn locate(&self, document: &dyn Document) -> Option<AcquisitionTarget>;
}

/// Tier 1: the conventionally named element, colored by its container if present
pub struct KnownId {
    pub value_id: String,
    pub color_id: Option<String>,
}

impl KnownId {
    /// Resolves the target for whatever element currently holds the id
    pub fn resolve(&self, document: &dyn Document) -> Option<AcquisitionTarget> {
        let value_node = document.element_by_id(&self.value_id)?;
        let color_node = self
            .color_id
            .as_deref()
            .and_then(|id| document.element_by_id(id))
            .unwrap_or(value_node);
        Some(AcquisitionTarget {
            value_node,
            color_node,
            origin: BindOrigin::KnownId,
        })
    }
}

impl DiscoveryStrategy for KnownId {
    fn name(&self) -> &'static str {
        "known id"
    }

    fn locate(&self, document: &dyn Document) -> Option<AcquisitionTarget> {
        self.resolve(document)
    }
}

/// Tier 2: selector patterns, first element whose text parses as a time
pub struct SelectorSweep {
    pub selectors: Vec<String>,
}

impl DiscoveryStrategy for SelectorSweep {
    fn name(&self) -> &'static str {
        "selector sweep"
    }

    fn locate(&self, document: &dyn Document) -> Option<AcquisitionTarget> {
        for selector in &self.selectors {
            let nodes = match document.query_selector_all(selector) {
                Ok(nodes) => nodes,
                Err(e) => {
                    debug!("Skipping selector {}: {}", selector, e);
                    continue;
                }
            };
            trace!("Selector {} matched {} element(s)", selector, nodes.len());
            let found = nodes.into_iter().find(|node| {
                document
                    .text_content(*node)
                    .is_some_and(|text| is_time_format(&text))
            });
            if let Some(node) = found {
                return Some(AcquisitionTarget {
                    value_node: node,
                    color_node: node,
                    origin: BindOrigin::Selector,
                });
            }
        }
        None
    }
}

/// Tier 3: every text node under the body
pub struct TextWalk;

impl DiscoveryStrategy for TextWalk {
    fn name(&self) -> &'static str {
        "text walk"
    }

    fn locate(&self, document: &dyn Document) -> Option<AcquisitionTarget> {
        let text = document.text_nodes().into_iter().find(|node| {
            document
                .text_content(*node)
                .is_some_and(|text| is_time_format(&text))
        })?;
        Some(AcquisitionTarget {
            value_node: text,
            color_node: document.parent_element(text).unwrap_or(text),
            origin: BindOrigin::TextWalk,
        })
    }
}

/// Ordered strategy list
pub struct Discovery {
    strategies: Vec<Box<dyn DiscoveryStrategy>>,
}

impl Discovery {
    pub fn new(strategies: Vec<Box<dyn DiscoveryStrategy>>) -> Self {
        Self { strategies }
    }

    /// Known id, then selector sweep, then text walk
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(vec![
            Box::new(config.known_id()),
            Box::new(SelectorSweep {
                selectors: config.selectors.clone(),
            }),
            Box::new(TextWalk),
        ])
    }

    /// Runs the tiers in order; `None` means fall through to the document watcher
    pub fn run(&self, document: &dyn Document) -> Option<AcquisitionTarget> {
        for strategy in &self.strategies {
            if let Some(target) = strategy.locate(document) {
                debug!(
                    "Timer found via {}: value {} color {}",
                    strategy.name(),
                    target.value_node,
                    target.color_node
                );
                return Some(target);
            }
            trace!("Discovery tier '{}' found nothing", strategy.name());
        }
        None
    }
}

/// Whether any element's direct text currently reads like a timer
pub fn document_has_candidate(document: &dyn Document) -> bool {
    document
        .all_elements()
        .into_iter()
        .any(|node| is_time_format(&document.own_text(node)))
}

/// Effective background of `node`.
///
/// Walks up through ancestors while the resolved background is absent or
/// transparent; opaque black when the root is reached without a match.
pub fn resolve_color(document: &dyn Document, node: NodeId) -> ColorValue {
    let mut current = Some(node);
    while let Some(id) = current {
        if let Some(css) = document.computed_background(id) {
            let color = ColorValue::parse(&css);
            if !color.is_transparent() {
                return color;
            }
        }
        current = document.parent_element(id);
    }
    ColorValue::black()
}
