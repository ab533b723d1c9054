//! Interception layers: "check before, record after" for arbitrary operations.
//!
//! Operations are plain `tower::Service`s that know nothing about retries.
//! What the layers need from a request is declared once at wiring time
//! through a binding:
//! - [`ResourceBinding`]: where the job context and the single resource live.
//! - [`CollectionBinding`]: where the job context and the resource collection live.
//!
//! Three independently attachable modes are built on top:
//! - **Proactive** ([`ProactiveFilterLayer`]): filter a whole collection before the
//!   operation runs; the operation only ever sees eligible items.
//! - **Reactive** ([`ReactiveGateLayer`]): gate one resource right before its step and
//!   answer [`Gated::Skipped`] instead of running it.
//! - **Update** ([`RecordOutcomeLayer`]): record SUCCESS or FAILURE after every real
//!   invocation, on every exit path, then hand the original result back unchanged.
//!
//! Both check modes can also record (`ReactiveGateLayer::recording`,
//! `ProactiveFilterLayer::recording`), which fixes the order check → maybe execute →
//! record, with nothing recorded for a skipped resource.

use crate::context::{ResourceId, ResourceRef, RetryJobContext};
use std::fmt;
use std::sync::Arc;

pub mod proactive;
pub mod reactive;
pub mod record;

pub use proactive::{Filtered, ProactiveFilterLayer, ProactiveFilterService};
pub use reactive::{Gated, ReactiveGateLayer, ReactiveGateService, SkipNotice};
pub use record::{AlwaysSuccess, OutcomeClassifier, RecordOutcomeLayer, RecordOutcomeService};

type ContextFn<Req> = Arc<dyn Fn(&Req) -> RetryJobContext + Send + Sync>;

const DEFAULT_OPERATION: &str = "operation";

/// Role bindings of a single-resource operation.
pub struct ResourceBinding<Req> {
    operation: Arc<str>,
    context: ContextFn<Req>,
    resource: Arc<dyn Fn(&Req) -> ResourceId + Send + Sync>,
}

impl<Req> ResourceBinding<Req> {
    /// Bind the context and resource roles of `Req`.
    pub fn new<C, R>(context: C, resource: R) -> Self
    where
        C: Fn(&Req) -> RetryJobContext + Send + Sync + 'static,
        R: Fn(&Req) -> ResourceId + Send + Sync + 'static,
    {
        Self {
            operation: Arc::from(DEFAULT_OPERATION),
            context: Arc::new(context),
            resource: Arc::new(resource),
        }
    }

    /// Name the operation in logs and telemetry.
    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.operation = Arc::from(name.into());
        self
    }

    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    pub(crate) fn context_of(&self, req: &Req) -> RetryJobContext {
        (self.context)(req)
    }

    pub(crate) fn resource_of(&self, req: &Req) -> ResourceId {
        (self.resource)(req)
    }
}

impl<Req> Clone for ResourceBinding<Req> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            context: self.context.clone(),
            resource: self.resource.clone(),
        }
    }
}

impl<Req> fmt::Debug for ResourceBinding<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBinding").field("operation", &self.operation).finish()
    }
}

/// Role bindings of a bulk operation.
pub struct CollectionBinding<Req, T> {
    operation: Arc<str>,
    context: ContextFn<Req>,
    items: Arc<dyn Fn(&mut Req) -> &mut Vec<T> + Send + Sync>,
    resource_id: Arc<dyn Fn(&T) -> ResourceId + Send + Sync>,
}

impl<Req, T> CollectionBinding<Req, T> {
    /// Bind the context role, the collection (as a lens into the request), and
    /// the identity of one item.
    pub fn new<C, L, I>(context: C, items: L, resource_id: I) -> Self
    where
        C: Fn(&Req) -> RetryJobContext + Send + Sync + 'static,
        L: Fn(&mut Req) -> &mut Vec<T> + Send + Sync + 'static,
        I: Fn(&T) -> ResourceId + Send + Sync + 'static,
    {
        Self {
            operation: Arc::from(DEFAULT_OPERATION),
            context: Arc::new(context),
            items: Arc::new(items),
            resource_id: Arc::new(resource_id),
        }
    }

    /// Name the operation in logs and telemetry.
    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.operation = Arc::from(name.into());
        self
    }

    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    pub(crate) fn context_of(&self, req: &Req) -> RetryJobContext {
        (self.context)(req)
    }

    pub(crate) fn items_of<'a>(&self, req: &'a mut Req) -> &'a mut Vec<T> {
        (self.items)(req)
    }

    pub(crate) fn id_of(&self, item: &T) -> ResourceId {
        (self.resource_id)(item)
    }
}

impl<Req, P> CollectionBinding<Req, ResourceRef<P>>
where
    P: 'static,
{
    /// Binding for collections of [`ResourceRef`]s, which carry their own identity.
    pub fn of_resources<C, L>(context: C, items: L) -> Self
    where
        C: Fn(&Req) -> RetryJobContext + Send + Sync + 'static,
        L: Fn(&mut Req) -> &mut Vec<ResourceRef<P>> + Send + Sync + 'static,
    {
        Self::new(context, items, |r: &ResourceRef<P>| r.id().clone())
    }
}

impl<Req, T> Clone for CollectionBinding<Req, T> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            context: self.context.clone(),
            items: self.items.clone(),
            resource_id: self.resource_id.clone(),
        }
    }
}

impl<Req, T> fmt::Debug for CollectionBinding<Req, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionBinding").field("operation", &self.operation).finish()
    }
}
