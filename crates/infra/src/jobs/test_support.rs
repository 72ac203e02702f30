//! Scripted protocol fakes for job tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use outreach_protocol::{
    ConversationCursor, ConversationPage, LoginChannel, ProtocolConnector, ProtocolError,
    ProtocolResult, ProtocolSession, RemoteUser, ResolvedIdentifier, SessionBlob,
    TransportConfig, VerifyBatch,
};

#[derive(Default)]
pub(crate) struct FakeSession {
    /// Phone number -> registered user.
    pub directory: HashMap<String, RemoteUser>,
    pub retry_later: HashSet<String>,
    /// Alias (without `@`) -> user.
    pub aliases: HashMap<String, RemoteUser>,
    pub existing: Vec<RemoteUser>,
    /// Page `i` is served for cursor `"i"` (the first for no cursor).
    pub pages: Vec<ConversationPage>,
    /// `(remote_id, access_hash)` pairs that sends reject as stale.
    pub stale_peers: HashSet<(i64, i64)>,
    /// When set, `bulk_verify` and `send_message` each take a permit first.
    gate: Option<Arc<Semaphore>>,
    script: Mutex<HashMap<&'static str, VecDeque<Option<ProtocolError>>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeSession {
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn fail_next(&self, op: &'static str, err: ProtocolError) {
        self.fail_after(op, 0, err);
    }

    /// Let `op` succeed `successes` times, then fail once with `err`.
    pub fn fail_after(&self, op: &'static str, successes: usize, err: ProtocolError) {
        let mut script = self.script.lock().unwrap();
        let queue = script.entry(op).or_default();
        queue.extend(std::iter::repeat_n(None, successes));
        queue.push_back(Some(err));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, op: &'static str, call: String, gated: bool) -> ProtocolResult<()> {
        if gated {
            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|_| ProtocolError::Cancelled)?
                    .forget();
            }
        }
        self.calls.lock().unwrap().push(call);
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(VecDeque::pop_front)
            .flatten();
        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProtocolSession for FakeSession {
    async fn bulk_verify(&self, identifiers: &[String]) -> ProtocolResult<VerifyBatch> {
        self.enter("bulk_verify", format!("bulk_verify:{}", identifiers.join(",")), true)
            .await?;
        let mut batch = VerifyBatch::default();
        for id in identifiers {
            if self.retry_later.contains(id) {
                batch.retry_later.push(id.clone());
            } else if let Some(user) = self.directory.get(id) {
                batch.resolved.push(ResolvedIdentifier {
                    identifier: id.clone(),
                    user: user.clone(),
                });
            } else {
                batch.unresolved.push(id.clone());
            }
        }
        Ok(batch)
    }

    async fn list_existing_relationships(&self) -> ProtocolResult<Vec<RemoteUser>> {
        self.enter("list_existing_relationships", "list_existing".into(), false)
            .await?;
        Ok(self.existing.clone())
    }

    async fn remove_relationships(&self, users: &[RemoteUser]) -> ProtocolResult<()> {
        let ids: Vec<String> = users.iter().map(|u| u.remote_id.to_string()).collect();
        self.enter("remove_relationships", format!("remove:{}", ids.join(",")), false)
            .await
    }

    async fn send_message(&self, target: &RemoteUser, _text: &str) -> ProtocolResult<()> {
        self.enter("send_message", format!("send:{}", target.remote_id), true)
            .await?;
        if self
            .stale_peers
            .contains(&(target.remote_id, target.access_hash))
        {
            return Err(ProtocolError::PeerInvalid);
        }
        Ok(())
    }

    async fn resolve_alias(&self, alias: &str) -> ProtocolResult<RemoteUser> {
        self.enter("resolve_alias", format!("resolve:{alias}"), false)
            .await?;
        self.aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| ProtocolError::NotFound(alias.to_string()))
    }

    async fn list_conversations(
        &self,
        cursor: Option<&ConversationCursor>,
    ) -> ProtocolResult<ConversationPage> {
        let index = cursor.and_then(|c| c.0.parse::<usize>().ok()).unwrap_or(0);
        self.enter("list_conversations", format!("conversations:{index}"), false)
            .await?;
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }
}

/// Hands out the same scripted session for every stored session blob.
pub(crate) struct FakeConnector {
    session: Arc<FakeSession>,
    pub opened: AtomicUsize,
}

impl FakeConnector {
    pub fn new(session: Arc<FakeSession>) -> Self {
        Self {
            session,
            opened: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProtocolConnector for FakeConnector {
    async fn open_connection(
        &self,
        session: &SessionBlob,
        _transport: &TransportConfig,
    ) -> ProtocolResult<Arc<dyn ProtocolSession>> {
        if session.0.is_empty() {
            return Err(ProtocolError::SessionRevoked);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.session.clone())
    }

    async fn begin_login(&self, _transport: &TransportConfig) -> ProtocolResult<LoginChannel> {
        Err(ProtocolError::rejected("login is not scripted"))
    }
}
