//! Inference session lifecycle.
//!
//! An [`InferenceSession`] is the per-connection state machine:
//!
//! ```text
//! UNINITIALIZED --open--> OPEN --generate--> GENERATING --stop chunk--> OPEN
//!                           |                    |
//!                           +------close---------+-----> CLOSED
//! ```
//!
//! Live sessions are registered in a [`SessionTable`] keyed by connection.
//! Removing an entry cancels its connection and closes the session, which
//! drops the engine handle and any generation slot it holds.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::{GenerationDefaults, SlotScope},
    error::ServiceError,
    model::{EngineRequest, GenerationEngine, ModelRegistry, TokenStream},
    params::{self, LengthConstraint, LengthRequirement, ValidationError},
    protocol::{GenerateRequest, OpenSessionRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Open,
    Generating,
    Closed,
}

/// Fixed pool of engine capacity shared by every session and one-shot
/// request.
pub struct GenerationSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    scope: SlotScope,
}

impl GenerationSlots {
    pub fn new(capacity: usize, scope: SlotScope) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            scope,
        }
    }

    pub fn scope(&self) -> SlotScope {
        self.scope
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Never waits: a busy pool is reported to the caller.
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, ServiceError> {
        self.semaphore.clone().try_acquire_owned().map_err(|_| {
            ServiceError::ResourceExhausted(format!(
                "all {} generation slots are busy",
                self.capacity
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Budget {
    /// Prefix plus generated tokens may not exceed `max_length`.
    Total { max_length: usize },
    /// Generated tokens left for the rest of the session.
    NewTokens { remaining: usize },
}

struct ActiveSession {
    id: Uuid,
    model: String,
    engine: Arc<dyn GenerationEngine>,
    budget: Budget,
    prefix: String,
    prefix_tokens: usize,
    has_continuation: bool,
    _slot: Option<OwnedSemaphorePermit>,
}

impl ActiveSession {
    fn remaining(&self) -> usize {
        match self.budget {
            Budget::Total { max_length } => max_length.saturating_sub(self.prefix_tokens),
            Budget::NewTokens { remaining } => remaining,
        }
    }

    /// Validates a generate request and starts the engine. Leaves the
    /// session untouched on error.
    fn plan_cycle(
        &mut self,
        request: GenerateRequest,
        slots: &GenerationSlots,
        defaults: &GenerationDefaults,
    ) -> Result<GenerationCycle, ServiceError> {
        let params = params::validate(&request.params, LengthRequirement::Optional, defaults)?;
        if let Some(requested) = params.model.as_deref() {
            if requested != self.model {
                return Err(ValidationError::ModelMismatch {
                    session: self.model.clone(),
                    requested: requested.to_string(),
                }
                .into());
            }
        }

        let inputs = request.inputs.unwrap_or_default();
        if inputs.is_empty() && !self.has_continuation {
            return Err(ValidationError::MissingInputs.into());
        }

        let mut prefix = self.prefix.clone();
        prefix.push_str(&inputs);
        let prefix_tokens = self.engine.count_tokens(&prefix)?;

        let room_under = |max_length: usize| {
            max_length
                .checked_sub(prefix_tokens)
                .filter(|room| *room > 0)
                .ok_or(ValidationError::PrefixTooLong {
                    prefix_tokens,
                    max_length,
                })
        };
        let session_room = match self.budget {
            Budget::Total { max_length } => room_under(max_length)?,
            Budget::NewTokens { remaining } => remaining,
        };
        let cycle_cap = match params.length {
            Some(LengthConstraint::MaxNewTokens(n)) => n,
            Some(LengthConstraint::MaxLength(max_length)) => room_under(max_length)?,
            None => session_room,
        };
        let budget = cycle_cap.min(session_room);

        let slot = match slots.scope() {
            SlotScope::Cycle => Some(slots.try_acquire()?),
            SlotScope::Session => None,
        };

        self.prefix = prefix;
        self.prefix_tokens = prefix_tokens;
        let tokens = self.engine.generate(EngineRequest {
            prefix: self.prefix.clone(),
            sampling: params.sampling,
            budget,
        });

        debug!(
            session_id = %self.id,
            prefix_tokens,
            budget,
            sampling = ?params.sampling,
            "starting generate cycle"
        );

        Ok(GenerationCycle {
            budget,
            stop_sequence: request.stop_sequence,
            tokens,
            slot,
        })
    }

    fn record_cycle(&mut self, outputs: &str, emitted: usize) {
        self.prefix.push_str(outputs);
        self.prefix_tokens += emitted;
        self.has_continuation = true;
        if let Budget::NewTokens { remaining } = &mut self.budget {
            *remaining = remaining.saturating_sub(emitted);
        }
    }
}

enum Phase {
    Uninitialized,
    Open(ActiveSession),
    Generating(ActiveSession),
    Closed,
}

/// One running generate cycle, handed to the encoder.
pub struct GenerationCycle {
    /// Most tokens this cycle may emit.
    pub budget: usize,
    pub stop_sequence: Option<String>,
    pub tokens: TokenStream,
    pub(crate) slot: Option<OwnedSemaphorePermit>,
}

impl GenerationCycle {
    #[cfg(test)]
    pub(crate) fn new(tokens: TokenStream, budget: usize, stop_sequence: Option<String>) -> Self {
        Self {
            budget,
            stop_sequence,
            tokens,
            slot: None,
        }
    }
}

pub struct InferenceSession {
    phase: Phase,
}

impl Default for InferenceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceSession {
    pub fn new() -> Self {
        Self {
            phase: Phase::Uninitialized,
        }
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Uninitialized => SessionState::Uninitialized,
            Phase::Open(_) => SessionState::Open,
            Phase::Generating(_) => SessionState::Generating,
            Phase::Closed => SessionState::Closed,
        }
    }

    fn active(&self) -> Option<&ActiveSession> {
        match &self.phase {
            Phase::Open(active) | Phase::Generating(active) => Some(active),
            Phase::Uninitialized | Phase::Closed => None,
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        self.active().map(|active| active.id)
    }

    pub fn model(&self) -> Option<&str> {
        self.active().map(|active| active.model.as_str())
    }

    pub fn prefix(&self) -> Option<&str> {
        self.active().map(|active| active.prefix.as_str())
    }

    /// Tokens the session may still generate.
    pub fn remaining_budget(&self) -> Option<usize> {
        self.active().map(ActiveSession::remaining)
    }

    /// `UNINITIALIZED -> OPEN`.
    pub fn open(
        &mut self,
        request: &OpenSessionRequest,
        registry: &ModelRegistry,
        slots: &GenerationSlots,
        defaults: &GenerationDefaults,
    ) -> Result<Uuid, ServiceError> {
        match self.phase {
            Phase::Uninitialized => {}
            Phase::Open(_) | Phase::Generating(_) => {
                return Err(ServiceError::protocol(
                    "an inference session is already open on this connection",
                ));
            }
            Phase::Closed => return Err(closed()),
        }

        let params = params::validate(&request.parameters(), LengthRequirement::Required, defaults)?;
        let Some(length) = params.length else {
            return Err(ValidationError::MissingLength.into());
        };
        let (model, engine) = registry.resolve(params.model.as_deref())?;
        let budget = match length {
            LengthConstraint::MaxLength(max_length) => Budget::Total { max_length },
            LengthConstraint::MaxNewTokens(remaining) => Budget::NewTokens { remaining },
        };
        let slot = match slots.scope() {
            SlotScope::Session => Some(slots.try_acquire()?),
            SlotScope::Cycle => None,
        };

        let id = Uuid::new_v4();
        info!(session_id = %id, model = %model, ?budget, "opened inference session");

        self.phase = Phase::Open(ActiveSession {
            id,
            model,
            engine,
            budget,
            prefix: String::new(),
            prefix_tokens: 0,
            has_continuation: false,
            _slot: slot,
        });
        Ok(id)
    }

    /// `OPEN -> GENERATING`. Validation and capacity errors leave the
    /// session `OPEN`; engine errors close it.
    pub fn begin_generate(
        &mut self,
        request: GenerateRequest,
        slots: &GenerationSlots,
        defaults: &GenerationDefaults,
    ) -> Result<GenerationCycle, ServiceError> {
        let active = match &mut self.phase {
            Phase::Open(active) => active,
            Phase::Uninitialized => {
                return Err(ServiceError::protocol(
                    "generate received before open_inference_session",
                ));
            }
            Phase::Generating(_) => {
                return Err(ServiceError::protocol(
                    "a generate cycle is already in progress on this session",
                ));
            }
            Phase::Closed => return Err(closed()),
        };

        match active.plan_cycle(request, slots, defaults) {
            Ok(cycle) => {
                self.phase = match std::mem::replace(&mut self.phase, Phase::Closed) {
                    Phase::Open(active) => Phase::Generating(active),
                    other => other,
                };
                Ok(cycle)
            }
            Err(err @ ServiceError::Engine(_)) => {
                self.close();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// `GENERATING -> OPEN`, or `CLOSED` once the budget is used up.
    pub fn finish_cycle(&mut self, outputs: &str, emitted: usize) -> SessionState {
        self.phase = match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Generating(mut active) => {
                active.record_cycle(outputs, emitted);
                if active.remaining() == 0 {
                    info!(session_id = %active.id, "budget exhausted, closing inference session");
                    Phase::Closed
                } else {
                    Phase::Open(active)
                }
            }
            other => other,
        };
        self.state()
    }

    /// Moves to `CLOSED`, releasing engine resources. Idempotent.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Open(active) | Phase::Generating(active) => {
                info!(session_id = %active.id, model = %active.model, "closed inference session");
            }
            Phase::Uninitialized | Phase::Closed => {}
        }
    }
}

fn closed() -> ServiceError {
    ServiceError::protocol("inference session is closed")
}

pub type ConnectionId = u64;
pub type SharedSession = Arc<Mutex<InferenceSession>>;

struct TableEntry {
    session: SharedSession,
    cancel: CancellationToken,
    connected_at: Instant,
}

/// Live sessions, one per connection.
pub struct SessionTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ConnectionId, TableEntry>>,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a new connection with an uninitialised session.
    pub fn register(self: &Arc<Self>) -> SessionLease {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Mutex::new(InferenceSession::new()));
        let cancel = CancellationToken::new();

        self.entries.lock().insert(
            connection_id,
            TableEntry {
                session: session.clone(),
                cancel: cancel.clone(),
                connected_at: Instant::now(),
            },
        );

        SessionLease {
            connection_id,
            session,
            cancel,
            table: Arc::clone(self),
        }
    }

    /// Removes the connection's entry, cancels it and closes its session.
    /// Returns `false` if it was already gone.
    pub fn release(&self, connection_id: ConnectionId) -> bool {
        let Some(entry) = self.entries.lock().remove(&connection_id) else {
            return false;
        };
        entry.cancel.cancel();
        entry.session.lock().close();
        debug!(
            connection_id,
            connected_for = ?entry.connected_at.elapsed(),
            "released connection"
        );
        true
    }

    /// Signals every connection to wind down.
    pub fn cancel_all(&self) {
        for entry in self.entries.lock().values() {
            entry.cancel.cancel();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Connections whose session is `OPEN` or `GENERATING`.
    pub fn active_sessions(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| {
                matches!(
                    entry.session.lock().state(),
                    SessionState::Open | SessionState::Generating
                )
            })
            .count()
    }
}

/// A connection's handle on its table entry; dropping it releases the
/// entry on every exit path.
pub struct SessionLease {
    connection_id: ConnectionId,
    session: SharedSession,
    cancel: CancellationToken,
    table: Arc<SessionTable>,
}

impl SessionLease {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn session(&self) -> MutexGuard<'_, InferenceSession> {
        self.session.lock()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.table.release(self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::model::EchoEngine;

    fn registry() -> ModelRegistry {
        let engine: Arc<dyn GenerationEngine> = Arc::new(EchoEngine::new("m1"));
        ModelRegistry::from_engines("m1", [("m1".to_string(), engine)]).unwrap()
    }

    fn open_request(max_length: Option<i64>, max_new_tokens: Option<i64>) -> OpenSessionRequest {
        OpenSessionRequest {
            model: Some("m1".into()),
            max_length,
            max_new_tokens,
        }
    }

    fn generate(inputs: Option<&str>) -> GenerateRequest {
        GenerateRequest {
            inputs: inputs.map(str::to_string),
            ..GenerateRequest::default()
        }
    }

    struct Fixture {
        registry: ModelRegistry,
        slots: GenerationSlots,
        defaults: GenerationDefaults,
    }

    impl Fixture {
        fn new(slots: usize, scope: SlotScope) -> Self {
            Self {
                registry: registry(),
                slots: GenerationSlots::new(slots, scope),
                defaults: GenerationDefaults::default(),
            }
        }

        fn open(&self, session: &mut InferenceSession, request: OpenSessionRequest) {
            session
                .open(&request, &self.registry, &self.slots, &self.defaults)
                .unwrap();
        }

        fn begin(
            &self,
            session: &mut InferenceSession,
            request: GenerateRequest,
        ) -> Result<GenerationCycle, ServiceError> {
            session.begin_generate(request, &self.slots, &self.defaults)
        }
    }

    #[test]
    fn full_lifecycle_returns_to_open() {
        let fixture = Fixture::new(2, SlotScope::Cycle);
        let mut session = InferenceSession::new();
        assert_eq!(session.state(), SessionState::Uninitialized);

        fixture.open(&mut session, open_request(Some(50), None));
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.model(), Some("m1"));

        let cycle = fixture.begin(&mut session, generate(Some("Hello there"))).unwrap();
        assert_eq!(session.state(), SessionState::Generating);
        assert_eq!(cycle.budget, 48);

        let state = session.finish_cycle(" Hello there", 2);
        assert_eq!(state, SessionState::Open);
        assert_eq!(session.prefix(), Some("Hello there Hello there"));
        assert_eq!(session.remaining_budget(), Some(46));
    }

    #[test]
    fn wrong_state_messages_are_protocol_errors() {
        let fixture = Fixture::new(2, SlotScope::Cycle);
        let mut session = InferenceSession::new();

        let err = fixture.begin(&mut session, generate(Some("hi"))).err().unwrap();
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Uninitialized);

        fixture.open(&mut session, open_request(Some(50), None));
        let err = session
            .open(
                &open_request(Some(50), None),
                &fixture.registry,
                &fixture.slots,
                &fixture.defaults,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));

        let _cycle = fixture.begin(&mut session, generate(Some("hi"))).unwrap();
        let err = fixture.begin(&mut session, generate(Some("again"))).err().unwrap();
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Generating);
    }

    #[test]
    fn closed_session_rejects_everything_and_close_is_idempotent() {
        let fixture = Fixture::new(2, SlotScope::Cycle);
        let mut session = InferenceSession::new();
        fixture.open(&mut session, open_request(Some(50), None));

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        let err = fixture.begin(&mut session, generate(Some("hi"))).err().unwrap();
        assert!(matches!(err, ServiceError::Protocol(_)));
        let err = session
            .open(
                &open_request(Some(50), None),
                &fixture.registry,
                &fixture.slots,
                &fixture.defaults,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Protocol(_)));
    }

    #[test]
    fn conflicting_lengths_leave_session_unchanged() {
        let fixture = Fixture::new(2, SlotScope::Cycle);
        let mut session = InferenceSession::new();
        fixture.open(&mut session, open_request(Some(50), None));

        let mut request = generate(Some("hello"));
        request.params.max_length = Some(10);
        request.params.max_new_tokens = Some(5);
        let err = fixture.begin(&mut session, request).err().unwrap();

        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::ConflictingLength { .. })
        ));
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.prefix(), Some(""));
    }

    #[test]
    fn open_requires_known_model_and_one_length() {
        let fixture = Fixture::new(2, SlotScope::Cycle);
        let mut session = InferenceSession::new();

        for request in [
            open_request(None, None),
            open_request(Some(10), Some(10)),
            OpenSessionRequest {
                model: Some("missing".into()),
                max_length: Some(10),
                max_new_tokens: None,
            },
        ] {
            let err = session
                .open(&request, &fixture.registry, &fixture.slots, &fixture.defaults)
                .unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "{err}");
            assert_eq!(session.state(), SessionState::Uninitialized);
        }
    }

    #[test]
    fn inputs_may_be_omitted_only_with_buffered_context() {
        let fixture = Fixture::new(2, SlotScope::Cycle);
        let mut session = InferenceSession::new();
        fixture.open(&mut session, open_request(Some(50), None));

        for inputs in [None, Some("")] {
            let err = fixture.begin(&mut session, generate(inputs)).err().unwrap();
            assert!(matches!(
                err,
                ServiceError::Validation(ValidationError::MissingInputs)
            ));
        }

        let _cycle = fixture.begin(&mut session, generate(Some("a b"))).unwrap();
        session.finish_cycle(" a", 1);

        let cycle = fixture.begin(&mut session, generate(None)).unwrap();
        assert_eq!(cycle.budget, 47);
    }

    #[test]
    fn prefix_filling_max_length_is_rejected() {
        let fixture = Fixture::new(2, SlotScope::Cycle);
        let mut session = InferenceSession::new();
        fixture.open(&mut session, open_request(Some(3), None));

        let err = fixture
            .begin(&mut session, generate(Some("one two three")))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::PrefixTooLong {
                prefix_tokens: 3,
                max_length: 3
            })
        ));
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn cycle_budget_is_capped_by_the_session() {
        let fixture = Fixture::new(2, SlotScope::Cycle);
        let mut session = InferenceSession::new();
        fixture.open(&mut session, open_request(None, Some(4)));

        let mut request = generate(Some("x"));
        request.params.max_new_tokens = Some(10);
        let cycle = fixture.begin(&mut session, request).unwrap();
        assert_eq!(cycle.budget, 4);

        assert_eq!(session.finish_cycle(" x x x x", 4), SessionState::Closed);
    }

    #[tokio::test]
    async fn cycle_slots_are_released_when_the_cycle_ends() {
        let fixture = Fixture::new(1, SlotScope::Cycle);
        let mut first = InferenceSession::new();
        let mut second = InferenceSession::new();
        fixture.open(&mut first, open_request(Some(50), None));
        fixture.open(&mut second, open_request(Some(50), None));

        let mut cycle = fixture.begin(&mut first, generate(Some("hi"))).unwrap();
        assert_eq!(fixture.slots.available(), 0);

        let err = fixture.begin(&mut second, generate(Some("hi"))).err().unwrap();
        assert!(matches!(err, ServiceError::ResourceExhausted(_)));
        assert_eq!(second.state(), SessionState::Open);

        while cycle.tokens.next().await.is_some() {}
        drop(cycle);
        assert_eq!(fixture.slots.available(), 1);
        assert!(fixture.begin(&mut second, generate(Some("hi"))).is_ok());
    }

    #[test]
    fn session_slots_live_until_close() {
        let fixture = Fixture::new(1, SlotScope::Session);
        let mut first = InferenceSession::new();
        fixture.open(&mut first, open_request(Some(50), None));
        assert_eq!(fixture.slots.available(), 0);

        let mut second = InferenceSession::new();
        let err = second
            .open(
                &open_request(Some(50), None),
                &fixture.registry,
                &fixture.slots,
                &fixture.defaults,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::ResourceExhausted(_)));

        first.close();
        assert_eq!(fixture.slots.available(), 1);
    }

    #[test]
    fn releasing_a_lease_cancels_and_closes() {
        let fixture = Fixture::new(1, SlotScope::Cycle);
        let table = SessionTable::new();
        let lease = table.register();
        let token = lease.cancellation_token();
        let session = lease.session.clone();
        fixture.open(&mut lease.session(), open_request(Some(50), None));

        assert_eq!(table.connection_count(), 1);
        assert_eq!(table.active_sessions(), 1);

        drop(lease);
        assert!(token.is_cancelled());
        assert_eq!(session.lock().state(), SessionState::Closed);
        assert_eq!(table.connection_count(), 0);
    }
}
