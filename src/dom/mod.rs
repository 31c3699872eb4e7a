/*!
 # Document boundary

 The timer lives in a page this crate does not control. [`Document`] is the
 narrow view of that page the monitor needs: lookups, text, resolved
 background colors and mutation observers. [`MemoryDocument`] is a complete
 in-memory implementation used for headless pages and tests.
*/

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::Result;

mod memory;

pub use memory::MemoryDocument;

/// Opaque reference to an element or text node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// What a [`MutationObserver`] wants to hear about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserveOptions {
    /// Children added or removed
    pub child_list: bool,
    /// Text node data changed
    pub character_data: bool,
    /// Attribute changes
    pub attributes: bool,
    /// Restricts attribute changes to these names; empty means all
    pub attribute_filter: Vec<String>,
    /// Include descendants of the target
    pub subtree: bool,
}

impl ObserveOptions {
    /// Text and child changes anywhere below the target
    pub fn content() -> Self {
        Self {
            child_list: true,
            character_data: true,
            subtree: true,
            ..Self::default()
        }
    }

    /// Changes to the named attributes of the target only
    pub fn attributes(filter: &[&str]) -> Self {
        Self {
            attributes: true,
            attribute_filter: filter.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Whether a record of this kind is selected by these options
    pub fn accepts(&self, kind: &MutationKind) -> bool {
        match kind {
            MutationKind::ChildList => self.child_list,
            MutationKind::CharacterData => self.character_data,
            MutationKind::Attributes(name) => {
                self.attributes
                    && (self.attribute_filter.is_empty()
                        || self.attribute_filter.iter().any(|f| f == name))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    CharacterData,
    Attributes(String),
}

/// A single change reported by the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: NodeId,
    pub kind: MutationKind,
}

pub type MutationBatch = Vec<MutationRecord>;

/// Shared on/off switch of one observer registration.
///
/// Disconnecting takes effect immediately: the document stops delivering and
/// batches already queued are discarded by the receiver.
#[derive(Debug, Clone)]
pub struct ObserverHandle(Arc<AtomicBool>);

impl ObserverHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn disconnect(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receiving end of an observer registration
#[derive(Debug)]
pub struct MutationObserver {
    rx: mpsc::UnboundedReceiver<MutationBatch>,
    handle: ObserverHandle,
}

/// Document side of an observer registration
#[derive(Debug)]
pub struct ObserverSink {
    tx: mpsc::UnboundedSender<MutationBatch>,
    handle: ObserverHandle,
}

impl MutationObserver {
    /// Creates a connected sink/observer pair for a [`Document`] implementation
    pub fn channel() -> (ObserverSink, MutationObserver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ObserverHandle::new();
        (
            ObserverSink {
                tx,
                handle: handle.clone(),
            },
            MutationObserver { rx, handle },
        )
    }

    /// Waits for the next batch; `None` once disconnected or the document is gone
    pub async fn next_batch(&mut self) -> Option<MutationBatch> {
        if !self.handle.is_active() {
            return None;
        }
        let batch = self.rx.recv().await?;
        self.handle.is_active().then_some(batch)
    }

    pub fn handle(&self) -> ObserverHandle {
        self.handle.clone()
    }

    pub fn disconnect(&self) {
        self.handle.disconnect();
    }
}

impl ObserverSink {
    /// Delivers a batch; returns `false` once the registration is dead
    pub fn deliver(&self, batch: MutationBatch) -> bool {
        self.is_active() && self.tx.send(batch).is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active() && !self.tx.is_closed()
    }
}

/// Read-only view of a live page plus mutation observation
pub trait Document: Send + Sync + 'static {
    /// The body element, if the page has one yet
    fn body(&self) -> Option<NodeId>;

    /// Connected element carrying this id attribute
    fn element_by_id(&self, id: &str) -> Option<NodeId>;

    /// Connected elements matching a selector, in document order
    fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>>;

    /// Every connected element, in document order
    fn all_elements(&self) -> Vec<NodeId>;

    /// Every connected text node below the body, in document order
    fn text_nodes(&self) -> Vec<NodeId>;

    /// Concatenated text of the node and its descendants
    fn text_content(&self, node: NodeId) -> Option<String>;

    /// Text of the direct text children only
    fn own_text(&self, node: NodeId) -> String;

    fn element_id(&self, node: NodeId) -> Option<String>;

    fn parent_element(&self, node: NodeId) -> Option<NodeId>;

    /// Whether the node is still attached to the document
    fn is_connected(&self, node: NodeId) -> bool;

    /// Resolved background color; `None` when the node has no style
    fn computed_background(&self, node: NodeId) -> Option<String>;

    /// Registers an observer on `target`
    fn observe(&self, target: NodeId, options: ObserveOptions) -> MutationObserver;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_filter() {
        let options = ObserveOptions::attributes(&["style", "class"]);
        assert!(options.accepts(&MutationKind::Attributes("style".into())));
        assert!(!options.accepts(&MutationKind::Attributes("title".into())));
        assert!(!options.accepts(&MutationKind::ChildList));
        assert!(ObserveOptions::content().accepts(&MutationKind::CharacterData));
    }

    #[tokio::test]
    async fn test_disconnect_discards_queued_batches() {
        let (sink, mut observer) = MutationObserver::channel();
        let record = MutationRecord {
            target: NodeId(1),
            kind: MutationKind::ChildList,
        };
        assert!(sink.deliver(vec![record.clone()]));
        assert_eq!(observer.next_batch().await, Some(vec![record.clone()]));

        assert!(sink.deliver(vec![record.clone()]));
        observer.disconnect();
        assert!(!sink.deliver(vec![record]));
        assert_eq!(observer.next_batch().await, None);
    }
}
