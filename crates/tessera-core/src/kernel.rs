//! Kernel registry: kernel families by name, and their instances.
//!
//! A *family* is a named entry point plus an attribute parser. An *instance*
//! is a family bound to one attribute payload; the payload is parsed on the
//! first invocation and reused after that. Instances own the persistent
//! buffers their invocations allocate.
//!
//! The registry also holds the backend-wide "currently executing" marker. At
//! most one instance executes at a time; a nested invocation fails with
//! [`Error::ConcurrencyViolation`] instead of queuing.

use crate::attributes::Attributes;
use crate::backend::KernelContext;
use crate::device::ComputeDevice;
use crate::error::{Error, Result};
use crate::tensor::BufferId;
use core::any::Any;
use core::fmt;
use std::collections::HashMap;
use std::rc::Rc;

/// Kernel instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub(crate) u64);

impl KernelId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Parsed attribute value, type-erased.
pub type ParsedAttributes = Rc<dyn Any>;

type AttributeParser = Box<dyn Fn(&Attributes) -> Result<ParsedAttributes>>;
type EntryPoint<D> = Box<dyn Fn(&mut KernelContext<'_, D>, &dyn Any) -> Result<()>>;

/// A named kernel entry point with its attribute parser.
pub struct KernelFamily<D: ComputeDevice> {
    name: String,
    parse: AttributeParser,
    entry: EntryPoint<D>,
}

impl<D: ComputeDevice> KernelFamily<D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, ctx: &mut KernelContext<'_, D>, attributes: &dyn Any) -> Result<()> {
        (self.entry)(ctx, attributes)
    }
}

/// Attribute payload of an instance: raw until the first invocation.
pub enum AttributeState {
    Unparsed(Attributes),
    Parsed(ParsedAttributes),
}

struct KernelInstance<D: ComputeDevice> {
    family: Rc<KernelFamily<D>>,
    attributes: AttributeState,
    persistent: Vec<BufferId>,
}

pub struct KernelRegistry<D: ComputeDevice> {
    families: HashMap<String, Rc<KernelFamily<D>>>,
    instances: HashMap<KernelId, KernelInstance<D>>,
    executing: Option<KernelId>,
    next_id: u64,
}

impl<D: ComputeDevice + 'static> KernelRegistry<D> {
    pub fn new() -> Self {
        Self {
            families: HashMap::new(),
            instances: HashMap::new(),
            executing: None,
            next_id: 1,
        }
    }

    /// Register a kernel family that takes no attributes.
    ///
    /// # Example
    /// ```ignore
    /// registry.register("add", |ctx| {
    ///     let inputs = ctx.inputs().to_vec();
    ///     ctx.run(&ADD, &inputs, &[OutputSlot::ByIndex(0)])?;
    ///     Ok(())
    /// });
    /// ```
    pub fn register<F>(&mut self, name: impl Into<String>, entry: F)
    where
        F: Fn(&mut KernelContext<'_, D>) -> Result<()> + 'static,
    {
        self.register_with_attributes(name, |_| Ok(()), move |ctx, _: &()| entry(ctx));
    }

    /// Register a kernel family with a typed attribute parser.
    ///
    /// `parse` runs once per instance, on its first invocation.
    pub fn register_with_attributes<A, P, F>(&mut self, name: impl Into<String>, parse: P, entry: F)
    where
        A: 'static,
        P: Fn(&Attributes) -> Result<A> + 'static,
        F: Fn(&mut KernelContext<'_, D>, &A) -> Result<()> + 'static,
    {
        let name = name.into();
        let family_name = name.clone();
        let family = KernelFamily {
            name: name.clone(),
            parse: Box::new(move |raw: &Attributes| parse(raw).map(|a| Rc::new(a) as ParsedAttributes)),
            entry: Box::new(move |ctx: &mut KernelContext<'_, D>, attributes: &dyn Any| {
                let attributes = attributes.downcast_ref::<A>().ok_or_else(|| {
                    Error::InvalidAttribute(family_name.clone(), "unexpected attribute type".into())
                })?;
                entry(ctx, attributes)
            }),
        };
        self.families.insert(name, Rc::new(family));
    }

    pub fn has_family(&self, name: &str) -> bool {
        self.families.contains_key(name)
    }

    pub fn list_families(&self) -> Vec<String> {
        self.families.keys().cloned().collect()
    }

    /// Create an instance of a registered family. Attributes are not parsed yet.
    pub fn create(&mut self, name: &str, attributes: Attributes) -> Result<KernelId> {
        let family = self
            .families
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotImplemented(format!("kernel '{}'", name)))?;

        let id = KernelId(self.next_id);
        self.next_id += 1;
        self.instances.insert(
            id,
            KernelInstance {
                family,
                attributes: AttributeState::Unparsed(attributes),
                persistent: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Mark `id` as executing and return its family and parsed attributes.
    ///
    /// Attributes are parsed here on the first call. Every successful `begin`
    /// must be paired with [`finish`](Self::finish).
    pub(crate) fn begin(&mut self, id: KernelId) -> Result<(Rc<KernelFamily<D>>, ParsedAttributes)> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or(Error::KernelNotFound(id))?;
        if let Some(active) = self.executing {
            return Err(Error::ConcurrencyViolation {
                active,
                requested: id,
            });
        }

        let parsed = match &instance.attributes {
            AttributeState::Parsed(parsed) => Rc::clone(parsed),
            AttributeState::Unparsed(raw) => {
                let parsed = (instance.family.parse)(raw)?;
                tracing::trace!("Parsed attributes for kernel {} ({})", id, instance.family.name);
                instance.attributes = AttributeState::Parsed(Rc::clone(&parsed));
                parsed
            }
        };

        self.executing = Some(id);
        Ok((Rc::clone(&instance.family), parsed))
    }

    /// Clear the executing marker.
    pub(crate) fn finish(&mut self) {
        self.executing = None;
    }

    pub fn executing(&self) -> Option<KernelId> {
        self.executing
    }

    /// Attach a persistent buffer to the executing instance.
    pub(crate) fn attach_persistent(&mut self, buffer: BufferId) -> Result<KernelId> {
        let id = self.executing.ok_or_else(|| {
            Error::ShapeMismatch("persistent output requested outside a kernel invocation".into())
        })?;
        let instance = self.instances.get_mut(&id).ok_or(Error::KernelNotFound(id))?;
        instance.persistent.push(buffer);
        Ok(id)
    }

    pub fn persistent_buffers(&self, id: KernelId) -> Result<&[BufferId]> {
        self.instances
            .get(&id)
            .map(|i| i.persistent.as_slice())
            .ok_or(Error::KernelNotFound(id))
    }

    pub fn is_parsed(&self, id: KernelId) -> Result<bool> {
        self.instances
            .get(&id)
            .map(|i| matches!(i.attributes, AttributeState::Parsed(_)))
            .ok_or(Error::KernelNotFound(id))
    }

    pub fn name(&self, id: KernelId) -> Result<&str> {
        self.instances
            .get(&id)
            .map(|i| i.family.name())
            .ok_or(Error::KernelNotFound(id))
    }

    /// Take the instance's persistent buffers, leaving it registered.
    pub(crate) fn take_persistent(&mut self, id: KernelId) -> Result<Vec<BufferId>> {
        if self.executing == Some(id) {
            return Err(Error::ConcurrencyViolation {
                active: id,
                requested: id,
            });
        }
        let instance = self.instances.get_mut(&id).ok_or(Error::KernelNotFound(id))?;
        Ok(std::mem::take(&mut instance.persistent))
    }

    pub(crate) fn remove(&mut self, id: KernelId) -> Result<()> {
        self.instances
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::KernelNotFound(id))
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

impl<D: ComputeDevice + 'static> Default for KernelRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}
