//! Item graphs: the unit of exchange between adapters and the engine.
//!
//! A graph is a node, and a node is a graph. Adapters share nodes through
//! `Arc`, so the same node can appear on several edges and graphs may be
//! cyclic (a reply to a reply to itself); the engine's traversal keys its
//! visited set on the `Arc` pointer identity. Edge, collection, and
//! deferred-relation lists are mutex-guarded so a shared node can be
//! extended after it has been linked.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::item::Item;

/// How two nodes in a graph are related; essentially an edge label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub label: String,
    /// When true the edge has no direction; stored as the negation of the
    /// index's `directed` column.
    pub bidirectional: bool,
}

impl Relation {
    pub fn new(label: impl Into<String>, bidirectional: bool) -> Self {
        Relation {
            label: label.into(),
            bidirectional,
        }
    }

    /// "from is in reply to to"
    pub fn reply_to() -> Self {
        Relation::new("reply_to", false)
    }

    /// "either side is attached to the other"
    pub fn attached() -> Self {
        Relation::new("attached", true)
    }

    /// "from quotes to"
    pub fn quotes() -> Self {
        Relation::new("quotes", false)
    }
}

/// A relationship between entries already in the archive, referenced by
/// the IDs the data source assigned (never row IDs). Each side names an
/// item or a person. Best-effort: if a referenced entry is not in the
/// archive yet, the relation is dropped silently and can be
/// re-established by a later run.
#[derive(Debug, Clone)]
pub struct RawRelation {
    pub from_item_id: Option<String>,
    pub to_item_id: Option<String>,
    pub from_person_user_id: Option<String>,
    pub to_person_user_id: Option<String>,
    pub relation: Relation,
}

impl RawRelation {
    /// A relation between two items, by their service-assigned IDs.
    pub fn between_items(
        from: impl Into<String>,
        to: impl Into<String>,
        relation: Relation,
    ) -> Self {
        RawRelation {
            from_item_id: Some(from.into()),
            to_item_id: Some(to.into()),
            from_person_user_id: None,
            to_person_user_id: None,
            relation,
        }
    }

    /// A relation from an item to a person, by service-assigned IDs.
    pub fn item_to_person(
        from: impl Into<String>,
        to: impl Into<String>,
        relation: Relation,
    ) -> Self {
        RawRelation {
            from_item_id: Some(from.into()),
            to_item_id: None,
            from_person_user_id: None,
            to_person_user_id: Some(to.into()),
            relation,
        }
    }
}

/// A named, optionally-ordered group of items, such as an album.
#[derive(Debug)]
pub struct Collection {
    /// The ID of the collection as given by the service. Required so the
    /// collection is recognized the next time it is listed.
    pub original_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub items: Vec<CollectionItem>,
}

/// An item and its position within a collection.
#[derive(Debug)]
pub struct CollectionItem {
    pub item: Item,
    /// Only meaningful when ordering matters; the slice order of
    /// [`Collection::items`] is not.
    pub position: i64,
}

/// An outgoing edge: a target node and the labels connecting to it.
#[derive(Clone)]
pub struct Edge {
    pub target: Arc<ItemGraph>,
    pub relations: Vec<Relation>,
}

/// An item with optional connections to other items.
#[derive(Default)]
pub struct ItemGraph {
    /// The node item. May be absent: edges are only traversed when there
    /// is a node on both ends, but collections and raw relations are
    /// processed regardless.
    pub node: Option<Item>,

    edges: Mutex<Vec<Edge>>,
    collections: Mutex<Vec<Collection>>,
    relations: Mutex<Vec<RawRelation>>,
}

impl ItemGraph {
    /// A new single-node graph.
    pub fn new(item: Item) -> Arc<Self> {
        Arc::new(ItemGraph {
            node: Some(item),
            ..Default::default()
        })
    }

    /// A graph with no node, used to carry collections or raw relations
    /// on their own.
    pub fn without_node() -> Arc<Self> {
        Arc::new(ItemGraph::default())
    }

    /// Add `item` as a new node connected to `self` by `rel`, returning
    /// the new node so it can be connected further.
    pub fn add(self: &Arc<Self>, item: Item, rel: Relation) -> Arc<ItemGraph> {
        let node = ItemGraph::new(item);
        self.connect(&node, rel);
        node
    }

    /// Draw an edge from `self` to `target` labeled by `rel`. Connecting
    /// the same target again appends another label to the same edge.
    pub fn connect(&self, target: &Arc<ItemGraph>, rel: Relation) {
        let mut edges = self.edges.lock();
        if let Some(edge) = edges
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.target, target))
        {
            edge.relations.push(rel);
            return;
        }
        edges.push(Edge {
            target: Arc::clone(target),
            relations: vec![rel],
        });
    }

    /// Attach a collection whose members belong to this graph.
    pub fn attach_collection(&self, collection: Collection) {
        self.collections.lock().push(collection);
    }

    /// Record a deferred relation between entries already in the archive.
    pub fn relate(&self, relation: RawRelation) {
        self.relations.lock().push(relation);
    }

    /// Snapshot of the outgoing edges.
    pub fn edges(&self) -> Vec<Edge> {
        self.edges.lock().clone()
    }

    /// Drain the attached collections for processing.
    pub fn take_collections(&self) -> Vec<Collection> {
        std::mem::take(&mut *self.collections.lock())
    }

    /// Drain the deferred relations for processing.
    pub fn take_relations(&self) -> Vec<RawRelation> {
        std::mem::take(&mut *self.relations.lock())
    }
}
