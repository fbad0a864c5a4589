// ABOUTME: Runtime context threaded through constructors
// ABOUTME: Owns the config, the clock anchor, and the local peer identity

use crate::config::Config;
use crate::peer::messages::{Capacity, PeerDescriptor};
use crate::time::Clock;
use std::sync::Arc;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Buildable description of this process's identity.
#[derive(TypedBuilder, Clone, Debug)]
pub struct ContextOptions {
    /// Human-readable name advertised to the mesh.
    #[builder(setter(into))]
    pub name: String,
    /// Stable identity; persisted by the caller across restarts.
    #[builder(default = Uuid::new_v4())]
    pub uuid: Uuid,
    /// Advertised capacities.
    #[builder(default)]
    pub capacities: Vec<Capacity>,
    /// Runtime configuration.
    #[builder(default)]
    pub config: Config,
}

struct ContextInner {
    config: Config,
    clock: Clock,
    local_descriptor: PeerDescriptor,
}

/// Shared runtime context.
///
/// There are no process-wide singletons; every component receives the
/// context (or a piece of it) through its constructor. The instance uuid is
/// minted here, once per process.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Build a context from options.
    pub fn new(options: ContextOptions) -> Self {
        let local_descriptor = PeerDescriptor {
            uuid: options.uuid,
            instance_uuid: Uuid::new_v4(),
            name: options.name,
            version: env!("CARGO_PKG_VERSION").to_string(),
            capacities: options.capacities,
        };
        Self {
            inner: Arc::new(ContextInner {
                config: options.config,
                clock: Clock::new(),
                local_descriptor,
            }),
        }
    }

    /// The runtime configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The shared monotonic clock.
    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    /// Descriptor advertised for this process.
    pub fn local_descriptor(&self) -> PeerDescriptor {
        self.inner.local_descriptor.clone()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("local", &self.inner.local_descriptor.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let context = Context::new(ContextOptions::builder().name("living room").build());
        let descriptor = context.local_descriptor();
        assert_eq!(descriptor.name, "living room");
        assert!(descriptor.capacities.is_empty());
        assert_ne!(descriptor.uuid, descriptor.instance_uuid);
    }

    #[test]
    fn test_instance_uuid_fresh_per_context() {
        let uuid = Uuid::new_v4();
        let a = Context::new(
            ContextOptions::builder()
                .name("a")
                .uuid(uuid)
                .build(),
        );
        let b = Context::new(
            ContextOptions::builder()
                .name("b")
                .uuid(uuid)
                .build(),
        );
        assert_eq!(a.local_descriptor().uuid, b.local_descriptor().uuid);
        assert_ne!(
            a.local_descriptor().instance_uuid,
            b.local_descriptor().instance_uuid,
            "instance uuid must be minted per process"
        );
    }
}
