//! Durable conversation state.
//!
//! The store owns every persisted row: contacts, threads, messages,
//! scheduled jobs, and sales events. State lives in indexed in-memory
//! maps guarded by a single async `RwLock` and is mirrored to an
//! append-only JSONL journal, one serialized [`JournalRecord`] per
//! line. [`Store::open`] replays the journal, so stage transitions and
//! pending follow-up jobs survive restarts.
//!
//! Writes append their journal line inside the same critical section
//! that mutates the in-memory state. [`Store::commit_turn`] bundles a
//! stage mutation, the system message recording it, and any
//! schedule/cancel effects into one such section, so no reader ever
//! observes a stage advance without its audit message.
//!
//! # Disk format
//!
//! ```text
//! {"record":"contact","body":{"id":"...","phone":"+15551112222",...}}
//! {"record":"thread","body":{"id":"...","lead_stage":"cold",...}}
//! {"record":"message","body":{"thread_id":"...","role":"user",...}}
//! ```
//!
//! Records are upserts: replay applies them in order and the last write
//! for a row wins. Messages are immutable and journaled exactly once.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::leadflow::error::StoreError;

const JOURNAL_FILE: &str = "leadflow.jsonl";

/// Author of a [`MessageRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A person, identified by a normalized E.164 phone number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub phone: String,
    pub email: Option<String>,
    pub name: Option<String>,
    /// Completed orders attributed to this contact.
    pub orders_count: u32,
    /// Lifetime spend in cents.
    pub total_spent_cents: i64,
    pub created_at: DateTime<Utc>,
}

/// A 1:1 conversation between the system and one contact on one
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub channel: String,
    /// Current node in the funnel state machine. `None` until the
    /// funnel detector has seeded the thread.
    pub lead_stage: Option<String>,
    /// While true, all automated outbound activity is suppressed.
    pub human_takeover: bool,
    /// Opaque key/value bag: `funnel_id`, `stage_id`, `tags`, `source`,
    /// detector outputs. `lead_stage` is authoritative for stage;
    /// `meta.stage_id` is a write-through mirror.
    pub meta: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    /// The funnel this thread was classified into, if any.
    pub fn funnel_id(&self) -> Option<&str> {
        self.meta.get("funnel_id").and_then(Value::as_str)
    }
}

/// An immutable, ordered record within a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub role: Role,
    /// True only for assistant messages typed by a human operator.
    pub is_human: bool,
    /// Literal text, or a sentinel marker for a non-text artifact such
    /// as `[Audio sent: welcome]`.
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a [`ScheduledJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    /// Taken by a scheduler tick; ineligible for re-lease until
    /// `lease_until` passes.
    Leased,
    Fired,
    Cancelled,
    Failed,
}

/// A future action against a thread. At most one pending job exists per
/// (thread, key); scheduling with an existing key replaces the pending
/// row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub thread_id: Uuid,
    /// Purpose key, e.g. `cart_recovery_30m`. Cancellation is by key
    /// prefix.
    pub key: String,
    pub fire_at: DateTime<Utc>,
    pub status: JobStatus,
    pub lease_until: Option<DateTime<Utc>>,
    /// Opaque action payload; the scheduler decodes it into an action
    /// list when the job fires.
    pub actions: Value,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of a billing webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesEvent {
    pub id: Uuid,
    pub source: String,
    pub kind: String,
    pub order_id: String,
    pub buyer_email: Option<String>,
    pub buyer_phone: Option<String>,
    pub value_cents: i64,
    pub raw: Value,
    pub contact_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A job to create inside [`Store::commit_turn`] or via
/// [`Store::schedule_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub key: String,
    pub fire_at: DateTime<Utc>,
    pub actions: Value,
}

/// The deferred persistence effects of one processed turn, committed
/// atomically with respect to all readers.
#[derive(Debug, Clone, Default)]
pub struct TurnEffects {
    /// New value for `lead_stage` (also mirrored into `meta.stage_id`).
    pub stage: Option<String>,
    /// System message recording the transition or outcome.
    pub note: Option<String>,
    pub schedules: Vec<NewJob>,
    /// Key prefixes whose pending jobs are cancelled.
    pub cancel_prefixes: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "record", content = "body", rename_all = "lowercase")]
enum JournalRecord {
    Contact(Contact),
    Thread(Thread),
    Message(MessageRecord),
    Job(ScheduledJob),
    Sale(SalesEvent),
}

#[derive(Default)]
struct StoreState {
    contacts: HashMap<Uuid, Contact>,
    contacts_by_phone: HashMap<String, Uuid>,
    threads: HashMap<Uuid, Thread>,
    threads_by_contact_channel: HashMap<(Uuid, String), Uuid>,
    messages: HashMap<Uuid, Vec<MessageRecord>>,
    jobs: HashMap<Uuid, ScheduledJob>,
    sales: Vec<SalesEvent>,
    journal: Option<File>,
}

impl StoreState {
    fn journal_write(&mut self, record: &JournalRecord) -> Result<(), StoreError> {
        if let Some(file) = self.journal.as_mut() {
            let line = serde_json::to_string(record)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Contact(contact) => {
                self.contacts_by_phone
                    .insert(contact.phone.clone(), contact.id);
                self.contacts.insert(contact.id, contact);
            }
            JournalRecord::Thread(thread) => {
                self.threads_by_contact_channel
                    .insert((thread.contact_id, thread.channel.clone()), thread.id);
                self.threads.insert(thread.id, thread);
            }
            JournalRecord::Message(message) => {
                self.messages
                    .entry(message.thread_id)
                    .or_default()
                    .push(message);
            }
            JournalRecord::Job(job) => {
                self.jobs.insert(job.id, job);
            }
            JournalRecord::Sale(sale) => {
                self.sales.push(sale);
            }
        }
    }

    fn persist(&mut self, record: JournalRecord) -> Result<(), StoreError> {
        self.journal_write(&record)?;
        self.apply(record);
        Ok(())
    }

    /// Per-thread `created_at` is monotonic non-decreasing.
    fn next_message_timestamp(&self, thread_id: Uuid) -> DateTime<Utc> {
        let now = Utc::now();
        match self
            .messages
            .get(&thread_id)
            .and_then(|msgs| msgs.last())
            .map(|m| m.created_at)
        {
            Some(last) if last > now => last,
            _ => now,
        }
    }

    fn append_message_locked(
        &mut self,
        thread_id: Uuid,
        role: Role,
        content: &str,
        is_human: bool,
    ) -> Result<MessageRecord, StoreError> {
        if !self.threads.contains_key(&thread_id) {
            return Err(StoreError::NotFound("Thread", thread_id.to_string()));
        }
        let message = MessageRecord {
            id: Uuid::new_v4(),
            thread_id,
            role,
            is_human,
            content: content.to_string(),
            created_at: self.next_message_timestamp(thread_id),
        };
        self.persist(JournalRecord::Message(message.clone()))?;
        Ok(message)
    }

    fn upsert_job_locked(
        &mut self,
        thread_id: Uuid,
        new_job: NewJob,
    ) -> Result<ScheduledJob, StoreError> {
        // At most one pending job per (thread, key): replace any
        // existing pending row with the same key.
        let replaced: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|j| {
                j.thread_id == thread_id && j.key == new_job.key && j.status == JobStatus::Pending
            })
            .map(|j| j.id)
            .collect();
        for id in replaced {
            let mut old = self.jobs[&id].clone();
            old.status = JobStatus::Cancelled;
            self.persist(JournalRecord::Job(old))?;
        }
        let job = ScheduledJob {
            id: Uuid::new_v4(),
            thread_id,
            key: new_job.key,
            fire_at: new_job.fire_at,
            status: JobStatus::Pending,
            lease_until: None,
            actions: new_job.actions,
            created_at: Utc::now(),
        };
        self.persist(JournalRecord::Job(job.clone()))?;
        Ok(job)
    }

    fn cancel_jobs_locked(
        &mut self,
        thread_id: Uuid,
        key_prefix: &str,
    ) -> Result<usize, StoreError> {
        let matching: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|j| {
                j.thread_id == thread_id
                    && j.status == JobStatus::Pending
                    && j.key.starts_with(key_prefix)
            })
            .map(|j| j.id)
            .collect();
        for id in &matching {
            let mut job = self.jobs[id].clone();
            job.status = JobStatus::Cancelled;
            self.persist(JournalRecord::Job(job))?;
        }
        Ok(matching.len())
    }
}

/// Shallow-merge `patch` into `meta`. List-valued keys present on both
/// sides are set-unioned, preserving the existing order.
fn merge_meta(meta: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, incoming) in patch {
        match (meta.get_mut(key), incoming) {
            (Some(Value::Array(existing)), Value::Array(additions)) => {
                for item in additions {
                    if !existing.contains(item) {
                        existing.push(item.clone());
                    }
                }
            }
            _ => {
                meta.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Durable state for the orchestration engine.
///
/// All methods are `&self`; interior mutability is a single
/// `tokio::sync::RwLock`, so any individual operation is atomic with
/// respect to every other.
pub struct Store {
    state: RwLock<StoreState>,
}

impl Store {
    /// Open a store journaled under `dir`, replaying any existing
    /// journal.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let mut state = StoreState::default();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: JournalRecord = serde_json::from_str(&line).map_err(|e| {
                    StoreError::Corrupt(format!("{} line {}: {}", path.display(), lineno + 1, e))
                })?;
                state.apply(record);
            }
        }
        state.journal = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// A store with no journal. State is lost on drop; used by tests
    /// and dry runs.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    // ---- contacts ----

    /// Fetch the contact for `phone`, creating it lazily on first
    /// inbound.
    pub async fn get_or_create_contact(&self, phone: &str) -> Result<Contact, StoreError> {
        let mut state = self.state.write().await;
        if let Some(id) = state.contacts_by_phone.get(phone) {
            return Ok(state.contacts[id].clone());
        }
        let contact = Contact {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            email: None,
            name: None,
            orders_count: 0,
            total_spent_cents: 0,
            created_at: Utc::now(),
        };
        state.persist(JournalRecord::Contact(contact.clone()))?;
        Ok(contact)
    }

    pub async fn contact(&self, id: Uuid) -> Option<Contact> {
        self.state.read().await.contacts.get(&id).cloned()
    }

    pub async fn find_contact_by_phone(&self, phone: &str) -> Option<Contact> {
        let state = self.state.read().await;
        state
            .contacts_by_phone
            .get(phone)
            .map(|id| state.contacts[id].clone())
    }

    pub async fn find_contact_by_email(&self, email: &str) -> Option<Contact> {
        let state = self.state.read().await;
        state
            .contacts
            .values()
            .find(|c| c.email.as_deref() == Some(email))
            .cloned()
    }

    /// Record a completed purchase: bump aggregates and backfill the
    /// email if the contact had none.
    pub async fn record_purchase(
        &self,
        contact_id: Uuid,
        value_cents: i64,
        email: Option<&str>,
    ) -> Result<Contact, StoreError> {
        let mut state = self.state.write().await;
        let mut contact = state
            .contacts
            .get(&contact_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("Contact", contact_id.to_string()))?;
        contact.orders_count += 1;
        contact.total_spent_cents += value_cents;
        if contact.email.is_none() {
            contact.email = email.map(|e| e.to_string());
        }
        state.persist(JournalRecord::Contact(contact.clone()))?;
        Ok(contact)
    }

    // ---- threads ----

    /// Fetch the thread for `(contact, channel)`, creating it on first
    /// use. Exactly one thread exists per pair at a time.
    pub async fn get_or_create_thread(
        &self,
        contact_id: Uuid,
        channel: &str,
    ) -> Result<Thread, StoreError> {
        let mut state = self.state.write().await;
        if !state.contacts.contains_key(&contact_id) {
            return Err(StoreError::NotFound("Contact", contact_id.to_string()));
        }
        let key = (contact_id, channel.to_string());
        if let Some(id) = state.threads_by_contact_channel.get(&key) {
            return Ok(state.threads[id].clone());
        }
        let now = Utc::now();
        let thread = Thread {
            id: Uuid::new_v4(),
            contact_id,
            channel: channel.to_string(),
            lead_stage: None,
            human_takeover: false,
            meta: Map::new(),
            created_at: now,
            updated_at: now,
        };
        state.persist(JournalRecord::Thread(thread.clone()))?;
        Ok(thread)
    }

    pub async fn thread(&self, id: Uuid) -> Option<Thread> {
        self.state.read().await.threads.get(&id).cloned()
    }

    pub async fn list_threads(&self) -> Vec<Thread> {
        let state = self.state.read().await;
        let mut threads: Vec<Thread> = state.threads.values().cloned().collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        threads
    }

    /// The most recently active thread for a contact, any channel.
    pub async fn latest_thread_for_contact(&self, contact_id: Uuid) -> Option<Thread> {
        let state = self.state.read().await;
        state
            .threads
            .values()
            .filter(|t| t.contact_id == contact_id)
            .max_by_key(|t| t.updated_at)
            .cloned()
    }

    /// Merge `meta_patch` into the thread meta (shallow; list values
    /// are set-unioned) and optionally set the stage. The stage value
    /// is mirrored into `meta.stage_id`.
    pub async fn update_thread_meta_and_stage(
        &self,
        thread_id: Uuid,
        stage: Option<&str>,
        meta_patch: &Map<String, Value>,
    ) -> Result<Thread, StoreError> {
        let mut state = self.state.write().await;
        let mut thread = state
            .threads
            .get(&thread_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("Thread", thread_id.to_string()))?;
        merge_meta(&mut thread.meta, meta_patch);
        if let Some(stage) = stage {
            thread.lead_stage = Some(stage.to_string());
            thread
                .meta
                .insert("stage_id".to_string(), Value::String(stage.to_string()));
        }
        thread.updated_at = Utc::now();
        state.persist(JournalRecord::Thread(thread.clone()))?;
        Ok(thread)
    }

    pub async fn set_human_takeover(
        &self,
        thread_id: Uuid,
        on: bool,
    ) -> Result<Thread, StoreError> {
        let mut state = self.state.write().await;
        let mut thread = state
            .threads
            .get(&thread_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("Thread", thread_id.to_string()))?;
        thread.human_takeover = on;
        thread.updated_at = Utc::now();
        state.persist(JournalRecord::Thread(thread.clone()))?;
        Ok(thread)
    }

    // ---- messages ----

    pub async fn append_message(
        &self,
        thread_id: Uuid,
        role: Role,
        content: &str,
        is_human: bool,
    ) -> Result<MessageRecord, StoreError> {
        let mut state = self.state.write().await;
        state.append_message_locked(thread_id, role, content, is_human)
    }

    /// The last `limit` messages of a thread, oldest first. `None`
    /// returns the full log.
    pub async fn list_messages(
        &self,
        thread_id: Uuid,
        limit: Option<usize>,
    ) -> Vec<MessageRecord> {
        let state = self.state.read().await;
        let messages = match state.messages.get(&thread_id) {
            Some(msgs) => msgs,
            None => return Vec::new(),
        };
        let skip = match limit {
            Some(limit) if messages.len() > limit => messages.len() - limit,
            _ => 0,
        };
        messages[skip..].to_vec()
    }

    // ---- turn commit ----

    /// Persist the deferred effects of one processed turn atomically:
    /// the system note, the stage mutation, job upserts, and prefix
    /// cancellations all land in one critical section.
    pub async fn commit_turn(
        &self,
        thread_id: Uuid,
        effects: TurnEffects,
    ) -> Result<Thread, StoreError> {
        let mut state = self.state.write().await;
        let mut thread = state
            .threads
            .get(&thread_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("Thread", thread_id.to_string()))?;
        if let Some(note) = &effects.note {
            state.append_message_locked(thread_id, Role::System, note, false)?;
        }
        for prefix in &effects.cancel_prefixes {
            state.cancel_jobs_locked(thread_id, prefix)?;
        }
        for job in effects.schedules {
            state.upsert_job_locked(thread_id, job)?;
        }
        if let Some(stage) = &effects.stage {
            thread.lead_stage = Some(stage.clone());
            thread
                .meta
                .insert("stage_id".to_string(), Value::String(stage.clone()));
        }
        thread.updated_at = Utc::now();
        state.persist(JournalRecord::Thread(thread.clone()))?;
        Ok(thread)
    }

    // ---- scheduled jobs ----

    /// Upsert a pending job by (thread, key).
    pub async fn schedule_job(
        &self,
        thread_id: Uuid,
        job: NewJob,
    ) -> Result<ScheduledJob, StoreError> {
        let mut state = self.state.write().await;
        if !state.threads.contains_key(&thread_id) {
            return Err(StoreError::NotFound("Thread", thread_id.to_string()));
        }
        state.upsert_job_locked(thread_id, job)
    }

    /// Cancel every pending job on the thread whose key starts with
    /// `key_prefix`. Returns how many were cancelled.
    pub async fn cancel_jobs(
        &self,
        thread_id: Uuid,
        key_prefix: &str,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        state.cancel_jobs_locked(thread_id, key_prefix)
    }

    pub async fn has_pending_job(&self, thread_id: Uuid, key_prefix: &str) -> bool {
        let state = self.state.read().await;
        state.jobs.values().any(|j| {
            j.thread_id == thread_id
                && j.status == JobStatus::Pending
                && j.key.starts_with(key_prefix)
        })
    }

    /// Jobs on this thread, for the read model and tests.
    pub async fn jobs_for_thread(&self, thread_id: Uuid) -> Vec<ScheduledJob> {
        let state = self.state.read().await;
        let mut jobs: Vec<ScheduledJob> = state
            .jobs
            .values()
            .filter(|j| j.thread_id == thread_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Atomically lease every due job: pending rows whose `fire_at` has
    /// passed, plus leased rows whose lease expired (crashed worker).
    /// Leased rows are ineligible until `now + lease`.
    pub async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut state = self.state.write().await;
        let due: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| match j.status {
                JobStatus::Pending => j.fire_at <= now,
                JobStatus::Leased => j.lease_until.map_or(true, |until| until <= now),
                _ => false,
            })
            .map(|j| j.id)
            .collect();
        let mut leased = Vec::with_capacity(due.len());
        for id in due {
            let mut job = state.jobs[&id].clone();
            job.status = JobStatus::Leased;
            job.lease_until = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
            state.persist(JournalRecord::Job(job.clone()))?;
            leased.push(job);
        }
        leased.sort_by_key(|j| j.fire_at);
        Ok(leased)
    }

    /// Terminal transition for a leased job.
    pub async fn complete_job(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut job = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("ScheduledJob", job_id.to_string()))?;
        job.status = status;
        job.lease_until = None;
        state.persist(JournalRecord::Job(job))?;
        Ok(())
    }

    // ---- sales events ----

    /// Persist a billing event. Idempotent on (source, kind, order id):
    /// redelivery returns the stored event with `created == false`.
    pub async fn record_sale(
        &self,
        source: &str,
        kind: &str,
        order_id: &str,
        buyer_email: Option<&str>,
        buyer_phone: Option<&str>,
        value_cents: i64,
        raw: Value,
        contact_id: Option<Uuid>,
    ) -> Result<(SalesEvent, bool), StoreError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .sales
            .iter()
            .find(|s| s.source == source && s.kind == kind && s.order_id == order_id)
        {
            return Ok((existing.clone(), false));
        }
        let sale = SalesEvent {
            id: Uuid::new_v4(),
            source: source.to_string(),
            kind: kind.to_string(),
            order_id: order_id.to_string(),
            buyer_email: buyer_email.map(|s| s.to_string()),
            buyer_phone: buyer_phone.map(|s| s.to_string()),
            value_cents,
            raw,
            contact_id,
            created_at: Utc::now(),
        };
        state.persist(JournalRecord::Sale(sale.clone()))?;
        Ok((sale, true))
    }

    pub async fn sales_events(&self) -> Vec<SalesEvent> {
        self.state.read().await.sales.clone()
    }
}
