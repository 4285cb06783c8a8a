//! Field-level change notifications.
//!
//! Listeners register for one [`StateField`] (or all of them) and receive the
//! new value wrapped in a [`StateChange`]. Callbacks run on whichever task
//! applied the poll, after the engine has released its state lock, so a
//! listener may read the engine freely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::peers::ListChange;
use crate::types::{ConnectionState, HealthReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    State,
    NetworkName,
    Domain,
    SelfNodeId,
    Health,
    AcceptRoutes,
    ShieldsUp,
    AllowLanAccess,
    WebClient,
    LoginPageUrl,
    ExitNode,
    Peers,
}

impl StateField {
    pub fn name(&self) -> &'static str {
        match self {
            StateField::State => "state",
            StateField::NetworkName => "networkName",
            StateField::Domain => "domain",
            StateField::SelfNodeId => "selfNodeId",
            StateField::Health => "health",
            StateField::AcceptRoutes => "acceptRoutes",
            StateField::ShieldsUp => "shieldsUp",
            StateField::AllowLanAccess => "allowLanAccess",
            StateField::WebClient => "webClient",
            StateField::LoginPageUrl => "loginPageUrl",
            StateField::ExitNode => "exitNode",
            StateField::Peers => "peers",
        }
    }
}

/// A changed field together with its new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    State(ConnectionState),
    NetworkName(String),
    Domain(String),
    SelfNodeId(String),
    Health(HealthReport),
    AcceptRoutes(bool),
    ShieldsUp(bool),
    AllowLanAccess(bool),
    WebClient(bool),
    LoginPageUrl(String),
    ExitNode(String),
    Peers(ListChange),
}

impl StateChange {
    pub fn field(&self) -> StateField {
        match self {
            StateChange::State(_) => StateField::State,
            StateChange::NetworkName(_) => StateField::NetworkName,
            StateChange::Domain(_) => StateField::Domain,
            StateChange::SelfNodeId(_) => StateField::SelfNodeId,
            StateChange::Health(_) => StateField::Health,
            StateChange::AcceptRoutes(_) => StateField::AcceptRoutes,
            StateChange::ShieldsUp(_) => StateField::ShieldsUp,
            StateChange::AllowLanAccess(_) => StateField::AllowLanAccess,
            StateChange::WebClient(_) => StateField::WebClient,
            StateChange::LoginPageUrl(_) => StateField::LoginPageUrl,
            StateChange::ExitNode(_) => StateField::ExitNode,
            StateChange::Peers(_) => StateField::Peers,
        }
    }
}

pub type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// `None` listens to every field.
    field: Option<StateField>,
    listener: Listener,
}

#[derive(Default)]
pub struct Observers {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, field: StateField, listener: Listener) -> SubscriptionId {
        self.insert(Some(field), listener)
    }

    pub fn subscribe_all(&self, listener: Listener) -> SubscriptionId {
        self.insert(None, listener)
    }

    /// Returns false when the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.lock();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers each change, in order, to matching listeners.
    ///
    /// The listener list is copied first, so a callback may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<(Option<StateField>, Listener)> = self
            .lock()
            .iter()
            .map(|subscription| (subscription.field, Arc::clone(&subscription.listener)))
            .collect();

        for change in changes {
            let field = change.field();
            for (wanted, listener) in &listeners {
                if wanted.map_or(true, |wanted| wanted == field) {
                    listener(change);
                }
            }
        }
    }

    fn insert(&self, field: Option<StateField>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Subscription {
            id,
            field,
            listener,
        });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("subscriptions", &self.len())
            .finish()
    }
}
