//! Registry of call sessions, one per remote user.

use super::context::CallContext;
use super::error::CallError;
use super::session::CallSession;
use callcore::state::CallInfo;
use callcore::types::call::{EndCallReason, SessionId, UserId};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub type SessionHandle = Arc<Mutex<CallSession>>;

struct CallEntry {
    session: SessionHandle,
    ended: Arc<AtomicBool>,
}

impl CallEntry {
    fn is_live(&self) -> bool {
        !self.ended.load(Ordering::Acquire)
    }
}

/// Owns every call session of one client.
///
/// Session locks are never awaited while the registry lock is held, and
/// sessions never call back into the manager. Lookup and insertion happen
/// under one write guard, so there is at most one live session per peer.
pub struct CallManager {
    ctx: Arc<CallContext>,
    calls: RwLock<HashMap<UserId, CallEntry>>,
}

impl CallManager {
    pub fn new(ctx: Arc<CallContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            calls: RwLock::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<CallContext> {
        &self.ctx
    }

    pub fn local_user(&self) -> &UserId {
        &self.ctx.local_user
    }

    /// The session for `peer`, ended or not.
    pub async fn session(&self, peer: &UserId) -> Option<SessionHandle> {
        self.calls
            .read()
            .await
            .get(peer)
            .map(|entry| entry.session.clone())
    }

    /// The session for `peer` unless it has ended.
    pub async fn live_session(&self, peer: &UserId) -> Option<SessionHandle> {
        self.calls
            .read()
            .await
            .get(peer)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.session.clone())
    }

    async fn require(&self, peer: &UserId) -> Result<SessionHandle, CallError> {
        self.live_session(peer)
            .await
            .ok_or_else(|| CallError::NotFound(peer.to_string()))
    }

    fn insert(
        &self,
        calls: &mut HashMap<UserId, CallEntry>,
        peer: UserId,
        info: CallInfo,
    ) -> SessionHandle {
        let (session, ended) = CallSession::new_tracked(self.ctx.clone(), info);
        let entry = CallEntry {
            session: session.clone(),
            ended,
        };
        if let Some(old) = calls.insert(peer, entry) {
            debug!("Replaced ended session {:p}", Arc::as_ptr(&old.session));
        }
        session
    }

    /// The live session for `peer`, or a fresh incoming one. Incoming
    /// messages may arrive before the invite, so any of them can create it.
    pub(crate) async fn session_or_incoming(&self, peer: &UserId) -> SessionHandle {
        let mut calls = self.calls.write().await;
        if let Some(entry) = calls.get(peer).filter(|entry| entry.is_live()) {
            return entry.session.clone();
        }
        debug!("Creating incoming session for {peer}");
        self.insert(
            &mut calls,
            peer.clone(),
            CallInfo::new_incoming(peer.clone(), None),
        )
    }

    /// Invite `peer` to a call.
    pub async fn start_call(&self, peer: UserId) -> Result<SessionId, CallError> {
        let session = {
            let mut calls = self.calls.write().await;
            if calls.get(&peer).is_some_and(|entry| entry.is_live()) {
                return Err(CallError::AlreadyExists(peer.to_string()));
            }
            self.insert(&mut calls, peer.clone(), CallInfo::new_outgoing(peer))
        };
        let mut session = session.lock().await;
        session.invite().await?;
        Ok(session.session_id())
    }

    pub async fn accept_call(&self, peer: &UserId) -> Result<(), CallError> {
        self.require(peer).await?.lock().await.accept().await
    }

    pub async fn reject_call(&self, peer: &UserId) -> Result<(), CallError> {
        self.require(peer).await?.lock().await.reject().await
    }

    pub async fn end_call(&self, peer: &UserId) -> Result<(), CallError> {
        self.require(peer).await?.lock().await.hangup().await;
        Ok(())
    }

    /// Returns whether the call is muted afterwards.
    pub async fn toggle_mute(&self, peer: &UserId) -> Result<bool, CallError> {
        Ok(self.require(peer).await?.lock().await.toggle_mute().await)
    }

    pub async fn toggle_video(&self, peer: &UserId) -> Result<bool, CallError> {
        self.require(peer).await?.lock().await.toggle_video().await
    }

    pub async fn toggle_screen_share(&self, peer: &UserId) -> Result<bool, CallError> {
        self.require(peer).await?.lock().await.toggle_screen_share().await
    }

    fn snapshot(calls: &HashMap<UserId, CallEntry>) -> Vec<(UserId, SessionHandle)> {
        calls
            .iter()
            .map(|(peer, entry)| (peer.clone(), entry.session.clone()))
            .collect()
    }

    /// Peers with a call that has not ended.
    pub async fn active_peers(&self) -> Vec<UserId> {
        let mut peers: Vec<_> = self
            .calls
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Whether any call has reached `Active`.
    pub async fn has_active_call(&self) -> bool {
        let sessions = Self::snapshot(&*self.calls.read().await);
        for (_, session) in sessions {
            if session.lock().await.state().is_active() {
                return true;
            }
        }
        false
    }

    /// Drop ended sessions from the registry.
    pub async fn cleanup_ended_calls(&self) {
        self.calls.write().await.retain(|_, entry| entry.is_live());
    }

    /// End every live call and empty the registry.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.calls.write().await.drain().collect();
        for (peer, CallEntry { session, .. }) in sessions {
            let mut session = session.lock().await;
            if !session.is_ended() {
                info!("Ending call with {peer} on shutdown");
                session.end(EndCallReason::Shutdown, true).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::events::CallEvent;
    use crate::test_utils::create_test_pair;
    use callcore::state::CallState;

    #[tokio::test]
    async fn test_start_call_registers_and_invites() {
        let (alice, bob) = create_test_pair();
        let manager = CallManager::new(alice.ctx.clone());

        manager.start_call(bob.user.clone()).await.unwrap();

        assert_eq!(alice.signals.kinds(), vec!["call_invite"]);
        assert_eq!(manager.active_peers().await, vec![bob.user.clone()]);
        assert!(!manager.has_active_call().await);
        assert!(matches!(
            manager.start_call(bob.user.clone()).await,
            Err(CallError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_not_found() {
        let (alice, _bob) = create_test_pair();
        let manager = CallManager::new(alice.ctx.clone());
        let nobody = UserId::from("404");

        assert!(matches!(
            manager.accept_call(&nobody).await,
            Err(CallError::NotFound(_))
        ));
        assert!(matches!(
            manager.toggle_mute(&nobody).await,
            Err(CallError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ended_calls_are_replaced_and_reaped() {
        let (alice, bob) = create_test_pair();
        let manager = CallManager::new(alice.ctx.clone());
        manager.start_call(bob.user.clone()).await.unwrap();
        let first = manager.session(&bob.user).await.unwrap();

        manager.end_call(&bob.user).await.unwrap();
        assert!(manager.active_peers().await.is_empty());
        assert!(matches!(
            manager.end_call(&bob.user).await,
            Err(CallError::NotFound(_))
        ));

        manager.start_call(bob.user.clone()).await.unwrap();
        let second = manager.session(&bob.user).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        second.lock().await.hangup().await;
        manager.cleanup_ended_calls().await;
        assert!(manager.session(&bob.user).await.is_none());
    }

    #[tokio::test]
    async fn test_start_call_keeps_live_incoming_session() {
        let (alice, bob) = create_test_pair();
        let manager = CallManager::new(alice.ctx.clone());
        let incoming = manager.session_or_incoming(&bob.user).await;

        assert!(matches!(
            manager.start_call(bob.user.clone()).await,
            Err(CallError::AlreadyExists(_))
        ));
        let registered = manager.session(&bob.user).await.unwrap();
        assert!(Arc::ptr_eq(&incoming, &registered));
        assert!(alice.signals.kinds().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_start_and_incoming_share_one_session() {
        for _ in 0..20 {
            let (alice, bob) = create_test_pair();
            let manager = CallManager::new(alice.ctx.clone());

            let (caller, peer) = (manager.clone(), bob.user.clone());
            let start = tokio::spawn(async move { caller.start_call(peer).await });
            let (callee, peer) = (manager.clone(), bob.user.clone());
            let incoming =
                tokio::spawn(async move { callee.session_or_incoming(&peer).await });
            let (started, incoming) = (start.await.unwrap(), incoming.await.unwrap());

            let registered = manager.session(&bob.user).await.unwrap();
            assert!(Arc::ptr_eq(&incoming, &registered));
            match started {
                Ok(_) => assert_eq!(alice.signals.count("call_invite"), 1),
                Err(e) => {
                    assert!(matches!(e, CallError::AlreadyExists(_)));
                    assert_eq!(alice.signals.count("call_invite"), 0);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_registry_does_not_wait_on_ended_session_lock() {
        let (alice, bob) = create_test_pair();
        let manager = CallManager::new(alice.ctx.clone());
        manager.start_call(bob.user.clone()).await.unwrap();
        let first = manager.session(&bob.user).await.unwrap();
        manager.end_call(&bob.user).await.unwrap();

        let _held = first.lock().await;
        let replacement = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            manager.session_or_incoming(&bob.user),
        )
        .await
        .expect("lookup must not lock the session");
        assert!(!Arc::ptr_eq(&first, &replacement));
        assert_eq!(manager.active_peers().await, vec![bob.user.clone()]);
    }

    #[tokio::test]
    async fn test_shutdown_ends_live_calls() {
        let (alice, bob) = create_test_pair();
        let manager = CallManager::new(alice.ctx.clone());
        manager.start_call(bob.user.clone()).await.unwrap();
        let session = manager.session(&bob.user).await.unwrap();

        manager.shutdown().await;

        assert!(matches!(
            session.lock().await.state(),
            CallState::Ended {
                reason: EndCallReason::Shutdown,
                ..
            }
        ));
        assert_eq!(alice.signals.count("call_end"), 1);
        assert!(manager.active_peers().await.is_empty());
        assert_eq!(
            alice.events.count(|e| matches!(e, CallEvent::CallEnded { .. })),
            1
        );
    }
}
