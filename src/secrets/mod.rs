//! Credential store façade (spec.md §6 persistence: "Secrets and credentials
//! live in a secret store keyed by `(context, toolName)`").
//!
//! `toolName == server.name`; `context` is one of `{server.name, scope,
//! catalog-server, user-server, thread-server}` per spec.md §6. This is a
//! narrow trait — the production backend is an external collaborator
//! (spec.md §1 "out of scope ... the declarative storage layer beyond the
//! read/write/watch contract").

mod store;

pub use store::{CredentialBundle, InMemorySecretStore, SecretContext, SecretStore};
