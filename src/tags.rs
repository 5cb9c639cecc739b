//! Tag extraction from producer payloads
//!
//! Watchers derive tags from whatever payload they observed. A payload that
//! declares its own tags via [`HasTags`] wins outright; otherwise the
//! extractor falls back to the domain-entity references embedded in the
//! payload, tagging each as `entity-kind:identifier`.

/// Optional capability a producer payload can declare to supply its own
/// tags, bypassing structural extraction entirely.
pub trait HasTags {
    fn tags(&self) -> Vec<String>;
}

/// A reference to a domain entity embedded in a producer payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub kind: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn tag(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

/// The payload shapes watchers hand to the extractor.
///
/// Watchers live outside this crate; this enum is the seam through which
/// their payloads are inspected without the extractor knowing any concrete
/// framework type.
pub enum TagSource<'a> {
    /// Payload declares its own tags.
    Explicit(&'a dyn HasTags),

    /// Bare set of entity references, e.g. the models touched by a query.
    Entities(&'a [EntityRef]),

    /// A queued job: explicit tags if the job declares them, otherwise the
    /// entities captured in its properties.
    Job {
        explicit: Option<&'a dyn HasTags>,
        entities: &'a [EntityRef],
    },

    /// A dispatched event: the entities carried in the event payload.
    Event { entities: &'a [EntityRef] },

    /// A sent notification: the notifiable first, then any entities the
    /// notification itself references.
    Notification {
        notifiable: &'a EntityRef,
        entities: &'a [EntityRef],
    },
}

/// Derive the tags for the given payload.
pub fn extract_tags(source: TagSource<'_>) -> Vec<String> {
    let tags = match source {
        TagSource::Explicit(payload) => payload.tags(),
        TagSource::Entities(entities) => entity_tags(entities),
        TagSource::Job { explicit, entities } => {
            let explicit_tags = explicit.map(|p| p.tags()).unwrap_or_default();
            if explicit_tags.is_empty() {
                entity_tags(entities)
            } else {
                explicit_tags
            }
        }
        TagSource::Event { entities } => entity_tags(entities),
        TagSource::Notification {
            notifiable,
            entities,
        } => {
            let mut tags = vec![notifiable.tag()];
            tags.extend(entity_tags(entities));
            tags
        }
    };

    dedupe(tags)
}

fn entity_tags(entities: &[EntityRef]) -> Vec<String> {
    entities.iter().map(EntityRef::tag).collect()
}

fn dedupe(tags: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(tags.len());
    for tag in tags {
        if !seen.contains(&tag) {
            seen.push(tag);
        }
    }
    seen
}
