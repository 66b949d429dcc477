//! Runtime context threaded through every component
//!
//! Holds the process-instance identifier and the root tracing span. Components
//! clone it and instrument their tasks with [`RuntimeContext::span`] instead of
//! reading shared static logger state.

use std::fmt;

use tracing::Span;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeContext {
    instance_id: Uuid,
    role: Role,
    span: Span,
}

impl RuntimeContext {
    pub fn new(role: Role) -> Self {
        let instance_id = Uuid::new_v4();
        let span = tracing::info_span!("burrow", role = %role, instance = %instance_id);
        Self {
            instance_id,
            role,
            span,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
