//! In-memory stand-ins for the gateway, ledger and lease store used by unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::ledger::{LedgerEntry, RecordOutcome, UpdateLedger};
use crate::polling::lease::{Lease, LeaseError, LeaseStore, RenewOutcome};
use crate::telegram::{ChatGateway, GatewayError, InlineKeyboardMarkup, Update, WebhookInfo};

/// Builds a private-chat text message update.
pub fn text_update(update_id: i64, chat_id: i64, text: &str) -> Update {
    Update::from_value(json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "from": {"id": chat_id},
            "chat": {"id": chat_id, "type": "private"},
            "text": text,
        }
    }))
    .unwrap()
}

pub fn callback_update(update_id: i64, chat_id: i64, data: &str) -> Update {
    Update::from_value(json!({
        "update_id": update_id,
        "callback_query": {
            "id": format!("cb-{update_id}"),
            "from": {"id": chat_id},
            "message": {"message_id": 1, "chat": {"id": chat_id}},
            "data": data,
        }
    }))
    .unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
    pub keyboard: Option<InlineKeyboardMarkup>,
}

#[derive(Default)]
pub struct FakeChatGateway {
    batches: Mutex<VecDeque<Result<Vec<Update>, GatewayError>>>,
    polled_offsets: Mutex<Vec<Option<i64>>>,
    webhook_url: Mutex<String>,
    sticky_webhook: AtomicBool,
    webhook_deletes: AtomicUsize,
    send_failures: Mutex<VecDeque<GatewayError>>,
    send_attempts: AtomicUsize,
    sent: Mutex<Vec<SentMessage>>,
    answered: Mutex<Vec<String>>,
}

impl FakeChatGateway {
    pub fn push_batch(&self, batch: Result<Vec<Update>, GatewayError>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    /// A sticky webhook survives `delete_webhook`.
    pub fn set_webhook(&self, url: &str, sticky: bool) {
        *self.webhook_url.lock().unwrap() = url.to_string();
        self.sticky_webhook.store(sticky, Ordering::SeqCst);
    }

    pub fn fail_sends_with(&self, failures: Vec<GatewayError>) {
        self.send_failures.lock().unwrap().extend(failures);
    }

    pub fn polled_offsets(&self) -> Vec<Option<i64>> {
        self.polled_offsets.lock().unwrap().clone()
    }

    pub fn webhook_deletes(&self) -> usize {
        self.webhook_deletes.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|message| message.text).collect()
    }

    pub fn answered(&self) -> Vec<String> {
        self.answered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatGateway for FakeChatGateway {
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<Update>, GatewayError> {
        self.polled_offsets.lock().unwrap().push(offset);
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(batch) => batch,
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_webhook(&self, _drop_pending_updates: bool) -> Result<(), GatewayError> {
        self.webhook_deletes.fetch_add(1, Ordering::SeqCst);
        if !self.sticky_webhook.load(Ordering::SeqCst) {
            self.webhook_url.lock().unwrap().clear();
        }
        Ok(())
    }

    async fn get_webhook_info(&self) -> Result<WebhookInfo, GatewayError> {
        Ok(WebhookInfo {
            url: self.webhook_url.lock().unwrap().clone(),
            ..WebhookInfo::default()
        })
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<(), GatewayError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(SentMessage {
            chat_id,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        Ok(())
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        _text: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.answered.lock().unwrap().push(callback_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<BTreeMap<i64, LedgerEntry>>,
    failing: AtomicBool,
}

impl MemoryLedger {
    pub fn with_update_ids(ids: &[i64]) -> Self {
        let ledger = Self::default();
        {
            let mut entries = ledger.entries.lock().unwrap();
            for id in ids {
                let update = text_update(*id, 1, "seed");
                entries.insert(*id, LedgerEntry::from_update(&update, chrono::Utc::now()));
            }
        }
        ledger
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn update_ids(&self) -> Vec<i64> {
        self.entries.lock().unwrap().keys().copied().collect()
    }
}

#[async_trait]
impl UpdateLedger for MemoryLedger {
    async fn record(&self, entry: &LedgerEntry) -> Result<RecordOutcome, sqlx::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&entry.update_id) {
            return Ok(RecordOutcome::Duplicate);
        }
        entries.insert(entry.update_id, entry.clone());
        Ok(RecordOutcome::Recorded)
    }

    async fn resume_cursor(&self) -> Result<Option<i64>, sqlx::Error> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .keys()
            .next_back()
            .map(|update_id| update_id + 1))
    }
}

#[derive(Default)]
pub struct MemoryLeaseStore {
    keys: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLeaseStore {
    /// Simulates another holder taking the key.
    pub fn force_holder(&self, key: &str, token: &str) {
        self.keys.lock().unwrap().insert(
            key.to_string(),
            (token.to_string(), Instant::now() + Duration::from_secs(600)),
        );
    }

    fn live_holder(&self, key: &str) -> Option<String> {
        let mut keys = self.keys.lock().unwrap();
        match keys.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                keys.remove(key);
                None
            }
            Some((token, _)) => Some(token.clone()),
            None => None,
        }
    }

    fn put(&self, lease: &Lease) {
        self.keys.lock().unwrap().insert(
            lease.key.clone(),
            (lease.token.clone(), Instant::now() + lease.ttl),
        );
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, lease: &Lease) -> Result<bool, LeaseError> {
        if self.live_holder(&lease.key).is_some() {
            return Ok(false);
        }
        self.put(lease);
        Ok(true)
    }

    async fn renew(&self, lease: &Lease) -> Result<RenewOutcome, LeaseError> {
        match self.live_holder(&lease.key) {
            Some(token) if token == lease.token => {
                self.put(lease);
                Ok(RenewOutcome::Extended)
            }
            Some(_) => Ok(RenewOutcome::Lost),
            None => {
                self.put(lease);
                Ok(RenewOutcome::Reclaimed)
            }
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LeaseError> {
        if self.live_holder(&lease.key).as_deref() == Some(lease.token.as_str()) {
            self.keys.lock().unwrap().remove(&lease.key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LeaseError> {
        Ok(self.live_holder(key))
    }
}
