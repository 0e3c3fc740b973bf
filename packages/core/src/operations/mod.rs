//! Node Operations - OCC retry layer
//!
//! Sibling reordering is the mutation most prone to version conflicts:
//! two clients reordering the same parent's children race on every child
//! version. Instead of surfacing the first conflict, [`SiblingReorderQueue`]
//! retries with fresh state, which makes concurrent reorders commute -
//! the later-committed intent wins and no intermediate state is observable.

mod reorder;

pub use reorder::{ReorderRetryConfig, SiblingReorderQueue};
