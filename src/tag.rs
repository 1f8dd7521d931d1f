//! Hierarchical flow-control tags.
//!
//! A tag is a shared label that jobs hold while they execute code "inside"
//! it. Freezing a tag suspends every holder at its next checkpoint, blocking
//! it makes every holder unwind out of the tagged scope, and stopping it
//! does the same once, without leaving the tag in a blocked state.
//!
//! Tags form a tree: a job holding a child tag is affected by anything done
//! to an ancestor.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::logging;
use crate::scheduler::Scheduler;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(u64);

impl TagId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TagId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

struct TagInner {
    id: TagId,
    name: Rc<str>,
    frozen: Cell<bool>,
    blocked: Cell<bool>,
    payload: RefCell<Option<Value>>,
    priority: Cell<u8>,
    parent: Option<Tag>,
}

/// Shared handle to a tag. Equality is identity.
#[derive(Clone)]
pub struct Tag(Rc<TagInner>);

impl Tag {
    /// Lowest priority a tag can carry.
    pub const PRIORITY_MIN: u8 = 0;
    /// Priority of a new tag, and of a job holding no tag at all.
    pub const PRIORITY_DEFAULT: u8 = 1;

    /// A new root tag.
    pub fn fresh(name: impl AsRef<str>) -> Tag {
        Tag::with_parent(name, None)
    }

    /// A new tag whose state is also governed by `parent`.
    pub fn fresh_child(parent: &Tag, name: impl AsRef<str>) -> Tag {
        Tag::with_parent(name, Some(parent.clone()))
    }

    fn with_parent(name: impl AsRef<str>, parent: Option<Tag>) -> Tag {
        Tag(Rc::new(TagInner {
            id: TagId::next(),
            name: Rc::from(name.as_ref()),
            frozen: Cell::new(false),
            blocked: Cell::new(false),
            payload: RefCell::new(None),
            priority: Cell::new(Tag::PRIORITY_DEFAULT),
            parent,
        }))
    }

    pub fn id(&self) -> TagId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn parent(&self) -> Option<&Tag> {
        self.0.parent.as_ref()
    }

    /// This tag followed by its ancestors, nearest first.
    pub fn ancestry(&self) -> impl Iterator<Item = &Tag> {
        std::iter::successors(Some(self), |tag| tag.parent())
    }

    /// Frozen itself or through an ancestor.
    pub fn frozen(&self) -> bool {
        self.ancestry().any(|tag| tag.0.frozen.get())
    }

    /// Blocked itself or through an ancestor.
    pub fn blocked(&self) -> bool {
        self.ancestry().any(|tag| tag.0.blocked.get())
    }

    pub fn priority(&self) -> u8 {
        self.0.priority.get()
    }

    /// Jobs holding the tag see the new priority immediately.
    pub fn set_priority(&self, priority: u8) {
        tracing::debug!(target: logging::TAG, tag = %self, priority, "set priority");
        self.0.priority.set(priority);
    }

    pub fn freeze(&self) {
        tracing::debug!(target: logging::TAG, tag = %self, "freeze");
        self.0.frozen.set(true);
    }

    pub fn unfreeze(&self) {
        tracing::debug!(target: logging::TAG, tag = %self, "unfreeze");
        self.0.frozen.set(false);
    }

    /// Block the tag: holders unwind out of it, and new entries are skipped,
    /// until [`Tag::unblock`].
    pub fn block(&self, payload: Value) {
        tracing::debug!(target: logging::TAG, tag = %self, %payload, "block");
        *self.0.payload.borrow_mut() = Some(payload);
        self.0.blocked.set(true);
    }

    pub fn unblock(&self) {
        tracing::debug!(target: logging::TAG, tag = %self, "unblock");
        self.0.blocked.set(false);
        self.0.payload.borrow_mut().take();
    }

    /// Payload of the nearest blocked tag on the ancestry chain.
    ///
    /// # Panics
    ///
    /// Panics if the tag is not blocked.
    pub fn payload_get(&self) -> Value {
        for tag in self.ancestry() {
            if tag.0.blocked.get() {
                return tag.0.payload.borrow().clone().unwrap_or_default();
            }
        }
        panic!("Tag::payload_get: tag `{}` is not blocked", self.name())
    }

    /// True if `ancestor` is this tag or one of its ancestors.
    pub fn derives_from(&self, ancestor: &Tag) -> bool {
        self.ancestry().any(|tag| tag == ancestor)
    }

    /// Make every job holding this tag (or a descendant) unwind out of the
    /// outermost affected scope, delivering `payload` there.
    ///
    /// Nothing persists: jobs entering the tag afterwards are unaffected.
    pub fn stop(&self, scheduler: &Scheduler, payload: Value) {
        tracing::debug!(target: logging::TAG, tag = %self, %payload, "stop");
        scheduler.signal_stop(self, &payload);
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Tag {}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("frozen", &self.0.frozen.get())
            .field("blocked", &self.0.blocked.get())
            .field("priority", &self.0.priority.get())
            .field("parent", &self.parent().map(Tag::name))
            .finish()
    }
}
