//! Session registry: user → (remote link, agent link) routing state.
//!
//! The registry owns routing state only; domain state (undo stack, pending
//! actions, watchdog) belongs to the agent process, and schedule entries to
//! the scheduler. Mutations are serialized per user: each user's slots sit
//! behind their own async mutex inside a read-mostly map, so two link
//! replacements for the same user cannot race and different users never
//! contend.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use periscope_proto::{EnvelopeBody, Frame};
use periscope_types::{LinkRole, RelayError, UserId};

use crate::link::LinkHandle;

/// A control command held for delivery while the agent is offline.
///
/// Only the last-issued command is kept, and only for a bounded grace
/// period; screen frames are never queued.
#[derive(Debug)]
struct QueuedCommand {
    body: EnvelopeBody,
    expires_at: Instant,
}

/// Per-user session slots, guarded by the user's own lock.
#[derive(Debug, Default)]
struct SessionSlots {
    remote: Option<LinkHandle>,
    agent: Option<LinkHandle>,
    suspended: bool,
    queued: Option<QueuedCommand>,
}

impl SessionSlots {
    fn slot_mut(&mut self, role: LinkRole) -> &mut Option<LinkHandle> {
        match role {
            LinkRole::Remote => &mut self.remote,
            LinkRole::Agent => &mut self.agent,
        }
    }

    fn slot(&self, role: LinkRole) -> Option<&LinkHandle> {
        match role {
            LinkRole::Remote => self.remote.as_ref(),
            LinkRole::Agent => self.agent.as_ref(),
        }
    }
}

struct UserSession {
    token: String,
    slots: std::sync::Arc<Mutex<SessionSlots>>,
}

/// Registry of registered users and their live links.
pub struct SessionRegistry {
    users: RwLock<HashMap<UserId, UserSession>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Register a user identity and its agent auth token.
    ///
    /// Registration is the out-of-scope setup step; the registry only
    /// records its result so `bind` can reject unknown identities.
    pub fn register(&self, user: UserId, token: impl Into<String>) {
        let mut users = self.users.write().expect("registry lock");
        users.insert(
            user,
            UserSession {
                token: token.into(),
                slots: std::sync::Arc::new(Mutex::new(SessionSlots::default())),
            },
        );
    }

    /// Check a presented token against the registered one.
    pub fn authenticate(&self, user: &UserId, token: &str) -> Result<(), RelayError> {
        let users = self.users.read().expect("registry lock");
        let session = users
            .get(user)
            .ok_or_else(|| RelayError::UnknownUser(user.clone()))?;
        if session.token != token {
            return Err(RelayError::Validation("invalid auth token".into()));
        }
        Ok(())
    }

    fn slots_for(&self, user: &UserId) -> Result<std::sync::Arc<Mutex<SessionSlots>>, RelayError> {
        let users = self.users.read().expect("registry lock");
        users
            .get(user)
            .map(|s| std::sync::Arc::clone(&s.slots))
            .ok_or_else(|| RelayError::UnknownUser(user.clone()))
    }

    /// Bind a link into its user/role slot, atomically replacing any prior
    /// link of the same role. The prior link is closed and returned.
    ///
    /// Fails with `UnknownUser` if the identity was never registered.
    pub async fn bind(&self, link: LinkHandle) -> Result<Option<LinkHandle>, RelayError> {
        let slots = self.slots_for(link.user())?;
        let mut slots = slots.lock().await;
        let replaced = slots.slot_mut(link.role()).replace(link.clone());
        if let Some(prior) = &replaced {
            info!(
                user = %link.user(),
                role = %link.role(),
                prior = %prior.id(),
                new = %link.id(),
                "replacing live link"
            );
            prior.close();
        } else {
            info!(user = %link.user(), role = %link.role(), id = %link.id(), "link bound");
        }
        Ok(replaced)
    }

    /// Remove a link from its slot, but only if the slot still holds this
    /// exact link instance (a replacement may already have taken it).
    ///
    /// Returns `true` if the slot was cleared.
    pub async fn unbind(&self, user: &UserId, role: LinkRole, link_id: Uuid) -> bool {
        let Ok(slots) = self.slots_for(user) else {
            return false;
        };
        let mut slots = slots.lock().await;
        match slots.slot(role) {
            Some(current) if current.id() == link_id => {
                current.close();
                *slots.slot_mut(role) = None;
                debug!(user = %user, role = %role, id = %link_id, "link unbound");
                true
            }
            _ => false,
        }
    }

    /// Forward a control message to the user's link of the given role.
    ///
    /// Fails with `PeerUnavailable` if no link of that role is live; the
    /// caller decides whether to queue (commands) or drop.
    pub async fn route(
        &self,
        user: &UserId,
        to: LinkRole,
        body: EnvelopeBody,
    ) -> Result<(), RelayError> {
        let slots = self.slots_for(user)?;
        let slots = slots.lock().await;
        match slots.slot(to) {
            Some(link) => link.send(body),
            None => Err(RelayError::PeerUnavailable(to)),
        }
    }

    /// The user's live agent link.
    pub async fn agent_link(&self, user: &UserId) -> Result<LinkHandle, RelayError> {
        let slots = self.slots_for(user)?;
        let slots = slots.lock().await;
        slots.agent.clone().ok_or(RelayError::AgentOffline)
    }

    /// Offer a frame to the user's remote link. Frames are dropped
    /// immediately when no remote link is present.
    pub async fn offer_frame(&self, user: &UserId, frame: Frame) -> Result<(), RelayError> {
        let slots = self.slots_for(user)?;
        let slots = slots.lock().await;
        if let Some(remote) = slots.slot(LinkRole::Remote) {
            remote.offer_frame(frame);
        }
        Ok(())
    }

    /// Queue the last-issued control command for delivery when the agent
    /// reconnects within the grace period. Replaces any previously queued
    /// command.
    pub async fn queue_command(
        &self,
        user: &UserId,
        body: EnvelopeBody,
        grace: Duration,
    ) -> Result<(), RelayError> {
        let slots = self.slots_for(user)?;
        let mut slots = slots.lock().await;
        slots.queued = Some(QueuedCommand {
            body,
            expires_at: Instant::now() + grace,
        });
        Ok(())
    }

    /// Take the queued command if one is present and unexpired.
    pub async fn take_queued(&self, user: &UserId) -> Option<EnvelopeBody> {
        let slots = self.slots_for(user).ok()?;
        let mut slots = slots.lock().await;
        let queued = slots.queued.take()?;
        if queued.expires_at < Instant::now() {
            debug!(user = %user, "queued command expired before agent reconnect");
            return None;
        }
        Some(queued.body)
    }

    /// Presence of the two links: `(remote_present, agent_present)`.
    pub async fn lookup(&self, user: &UserId) -> Result<(bool, bool), RelayError> {
        let slots = self.slots_for(user)?;
        let slots = slots.lock().await;
        Ok((slots.remote.is_some(), slots.agent.is_some()))
    }

    /// Whether the user's session is suspended.
    pub async fn is_suspended(&self, user: &UserId) -> Result<bool, RelayError> {
        let slots = self.slots_for(user)?;
        let slots = slots.lock().await;
        Ok(slots.suspended)
    }

    /// Set or clear the user's suspended flag.
    pub async fn set_suspended(&self, user: &UserId, suspended: bool) -> Result<(), RelayError> {
        let slots = self.slots_for(user)?;
        let mut slots = slots.lock().await;
        slots.suspended = suspended;
        Ok(())
    }

    /// Snapshot of all live links, for the liveness monitor.
    pub async fn live_links(&self) -> Vec<LinkHandle> {
        let sessions: Vec<_> = {
            let users = self.users.read().expect("registry lock");
            users
                .values()
                .map(|s| std::sync::Arc::clone(&s.slots))
                .collect()
        };
        let mut links = Vec::new();
        for slots in sessions {
            let slots = slots.lock().await;
            links.extend(slots.remote.iter().cloned());
            links.extend(slots.agent.iter().cloned());
        }
        links
    }

    /// All registered user ids.
    pub fn user_ids(&self) -> Vec<UserId> {
        let users = self.users.read().expect("registry lock");
        users.keys().cloned().collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_user() -> (SessionRegistry, UserId) {
        let registry = SessionRegistry::new();
        let user = UserId::new("u1");
        registry.register(user.clone(), "tok");
        (registry, user)
    }

    #[tokio::test]
    async fn bind_unknown_user_fails() {
        let registry = SessionRegistry::new();
        let (link, _rx) = LinkHandle::open(UserId::new("ghost"), LinkRole::Agent);
        let err = registry.bind(link).await.unwrap_err();
        assert!(matches!(err, RelayError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn authenticate_checks_token() {
        let (registry, user) = registry_with_user();
        assert!(registry.authenticate(&user, "tok").is_ok());
        assert!(registry.authenticate(&user, "bad").is_err());
        assert!(matches!(
            registry.authenticate(&UserId::new("ghost"), "tok"),
            Err(RelayError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn rebind_replaces_and_closes_prior_link() {
        let (registry, user) = registry_with_user();
        let (first, _rx1) = LinkHandle::open(user.clone(), LinkRole::Agent);
        let (second, _rx2) = LinkHandle::open(user.clone(), LinkRole::Agent);

        assert!(registry.bind(first.clone()).await.unwrap().is_none());
        let replaced = registry.bind(second.clone()).await.unwrap().unwrap();

        assert_eq!(replaced.id(), first.id());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.lookup(&user).await.unwrap(), (false, true));
    }

    #[tokio::test]
    async fn unbind_ignores_stale_link_ids() {
        let (registry, user) = registry_with_user();
        let (first, _rx1) = LinkHandle::open(user.clone(), LinkRole::Agent);
        let (second, _rx2) = LinkHandle::open(user.clone(), LinkRole::Agent);

        registry.bind(first.clone()).await.unwrap();
        registry.bind(second.clone()).await.unwrap();

        // The reader task of the replaced link races its cleanup against
        // the new link; it must not evict the replacement.
        assert!(!registry.unbind(&user, LinkRole::Agent, first.id()).await);
        assert_eq!(registry.lookup(&user).await.unwrap(), (false, true));

        assert!(registry.unbind(&user, LinkRole::Agent, second.id()).await);
        assert_eq!(registry.lookup(&user).await.unwrap(), (false, false));
    }

    #[tokio::test]
    async fn route_without_peer_is_peer_unavailable() {
        let (registry, user) = registry_with_user();
        let err = registry
            .route(&user, LinkRole::Agent, EnvelopeBody::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::PeerUnavailable(LinkRole::Agent)));
    }

    #[tokio::test]
    async fn frames_without_remote_are_dropped_silently() {
        let (registry, user) = registry_with_user();
        registry
            .offer_frame(&user, Frame::new(1, vec![0]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn queued_command_survives_until_grace_expiry() {
        let (registry, user) = registry_with_user();
        registry
            .queue_command(&user, EnvelopeBody::Ping, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(registry.take_queued(&user).await.is_some());
        assert!(registry.take_queued(&user).await.is_none());

        registry
            .queue_command(&user, EnvelopeBody::Ping, Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.take_queued(&user).await.is_none());
    }

    #[tokio::test]
    async fn suspended_flag_round_trips() {
        let (registry, user) = registry_with_user();
        assert!(!registry.is_suspended(&user).await.unwrap());
        registry.set_suspended(&user, true).await.unwrap();
        assert!(registry.is_suspended(&user).await.unwrap());
    }
}
