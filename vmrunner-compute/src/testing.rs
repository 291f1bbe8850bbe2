//! Scripted in-memory [`ComputeService`] for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::service::{
    CallFailure, CallOutcome, CallbackToken, ComputeService, GuestProcess, Notification,
    NotificationKind, ProcessHandle, ProcessIo, RawHandle, SystemHandle,
};

type SharedCallback = Arc<dyn Fn(Notification) + Send + Sync>;

/// Calls recorded by [`ScriptedService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Create,
    Open,
    Start,
    Shutdown,
    Terminate,
    Close,
    CreateProcess,
    CloseProcess,
}

/// How a scripted lifecycle call behaves.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Behavior {
    Complete,
    Fail(u32),
    /// Pending; the completion notification is delivered with `status`
    /// before the call returns (for create: as soon as a callback is
    /// registered on the new handle).
    PendingFires(i32),
    /// Pending; the completion notification never arrives.
    PendingSilent,
}

#[derive(Default)]
struct State {
    next_handle: RawHandle,
    existing: HashSet<String>,
    behaviors: HashMap<Op, Behavior>,
    callbacks: HashMap<RawHandle, (RawHandle, SharedCallback)>,
    deferred: HashMap<RawHandle, Vec<Notification>>,
    registration_failure: Option<u32>,
    unregisters: usize,
    calls: Vec<(Op, RawHandle)>,
    process: Option<(Behavior, ProcessIo)>,
}

pub(crate) struct ScriptedService {
    state: Mutex<State>,
}

impl ScriptedService {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State { next_handle: 1, ..State::default() }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn script(&self, op: Op, behavior: Behavior) {
        self.lock().behaviors.insert(op, behavior);
    }

    pub(crate) fn add_existing(&self, id: &str) {
        self.lock().existing.insert(id.to_owned());
    }

    pub(crate) fn fail_registration(&self, code: u32) {
        self.lock().registration_failure = Some(code);
    }

    pub(crate) fn script_process(&self, behavior: Behavior, io: ProcessIo) {
        self.lock().process = Some((behavior, io));
    }

    pub(crate) fn fresh_handle(&self) -> SystemHandle {
        let mut state = self.lock();
        let raw = state.next_handle;
        state.next_handle += 1;
        SystemHandle::from_raw(raw)
    }

    /// Deliver `notification` to every callback registered on `system`.
    pub(crate) fn fire(&self, system: &SystemHandle, notification: Notification) {
        self.fire_raw(system.as_raw(), &notification);
    }

    fn fire_raw(&self, system: RawHandle, notification: &Notification) {
        let targets: Vec<SharedCallback> = self
            .lock()
            .callbacks
            .values()
            .filter(|(owner, _)| *owner == system)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in targets {
            cb(notification.clone());
        }
    }

    pub(crate) fn registered_callbacks(&self) -> usize {
        self.lock().callbacks.len()
    }

    pub(crate) fn unregister_count(&self) -> usize {
        self.lock().unregisters
    }

    pub(crate) fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub(crate) fn calls(&self) -> Vec<Op> {
        self.lock().calls.iter().map(|(op, _)| *op).collect()
    }

    pub(crate) fn closed(&self) -> Vec<RawHandle> {
        self.lock()
            .calls
            .iter()
            .filter(|(op, _)| *op == Op::Close)
            .map(|(_, h)| *h)
            .collect()
    }

    fn behavior(&self, op: Op) -> Behavior {
        self.lock().behaviors.get(&op).copied().unwrap_or(Behavior::Complete)
    }

    fn record(&self, op: Op, handle: RawHandle) {
        self.lock().calls.push((op, handle));
    }

    fn transition(&self, op: Op, system: &SystemHandle, kind: NotificationKind) -> CallOutcome<()> {
        self.record(op, system.as_raw());
        match self.behavior(op) {
            Behavior::Complete => CallOutcome::Completed(()),
            Behavior::Fail(code) => CallOutcome::Failed(CallFailure::new(code, Some(format!("{op:?} refused")))),
            Behavior::PendingFires(status) => {
                self.fire_raw(system.as_raw(), &Notification { kind, status, data: None });
                CallOutcome::Pending(())
            }
            Behavior::PendingSilent => CallOutcome::Pending(()),
        }
    }
}

impl ComputeService for ScriptedService {
    fn create_system(&self, id: &str, _configuration: &str) -> CallOutcome<SystemHandle> {
        let behavior = self.behavior(Op::Create);
        if let Behavior::Fail(code) = behavior {
            self.record(Op::Create, 0);
            return CallOutcome::Failed(CallFailure::new(code, Some(format!("create {id} refused"))));
        }
        let system = self.fresh_handle();
        self.record(Op::Create, system.as_raw());
        self.lock().existing.insert(id.to_owned());
        match behavior {
            Behavior::PendingFires(status) => {
                self.lock().deferred.entry(system.as_raw()).or_default().push(Notification {
                    kind: NotificationKind::SystemCreateCompleted,
                    status,
                    data: None,
                });
                CallOutcome::Pending(system)
            }
            Behavior::PendingSilent => CallOutcome::Pending(system),
            Behavior::Complete | Behavior::Fail(_) => CallOutcome::Completed(system),
        }
    }

    fn open_system(&self, id: &str) -> Result<SystemHandle, CallFailure> {
        let exists = self.lock().existing.contains(id);
        if !exists {
            self.record(Op::Open, 0);
            return Err(CallFailure::new(0xC037_010E, Some(format!("{id} does not exist"))));
        }
        let system = self.fresh_handle();
        self.record(Op::Open, system.as_raw());
        Ok(system)
    }

    fn start_system(&self, system: &SystemHandle) -> CallOutcome<()> {
        self.transition(Op::Start, system, NotificationKind::SystemStartCompleted)
    }

    fn shutdown_system(&self, system: &SystemHandle) -> CallOutcome<()> {
        self.transition(Op::Shutdown, system, NotificationKind::SystemExited)
    }

    fn terminate_system(&self, system: &SystemHandle) -> CallOutcome<()> {
        self.transition(Op::Terminate, system, NotificationKind::SystemExited)
    }

    fn close_system(&self, system: SystemHandle) -> Result<(), CallFailure> {
        self.record(Op::Close, system.as_raw());
        Ok(())
    }

    fn register_callback(
        &self,
        system: &SystemHandle,
        callback: crate::service::NotificationCallback,
    ) -> Result<CallbackToken, CallFailure> {
        let (token, deferred) = {
            let mut state = self.lock();
            if let Some(code) = state.registration_failure {
                return Err(CallFailure::new(code, None));
            }
            let token = state.next_handle;
            state.next_handle += 1;
            state.callbacks.insert(token, (system.as_raw(), Arc::from(callback)));
            (token, state.deferred.remove(&system.as_raw()).unwrap_or_default())
        };
        for notification in &deferred {
            self.fire_raw(system.as_raw(), notification);
        }
        Ok(CallbackToken::from_raw(token))
    }

    fn unregister_callback(&self, token: CallbackToken) -> Result<(), CallFailure> {
        let mut state = self.lock();
        state.unregisters += 1;
        state.callbacks.remove(&token.as_raw());
        Ok(())
    }

    fn create_process(&self, system: &SystemHandle, _parameters: &str) -> CallOutcome<GuestProcess> {
        self.record(Op::CreateProcess, system.as_raw());
        let scripted = self.lock().process.take();
        let (behavior, io) = scripted.unwrap_or((Behavior::Complete, ProcessIo::default()));
        if let Behavior::Fail(code) = behavior {
            return CallOutcome::Failed(CallFailure::new(code, None));
        }
        let handle = {
            let mut state = self.lock();
            let raw = state.next_handle;
            state.next_handle += 1;
            ProcessHandle::from_raw(raw)
        };
        let process = GuestProcess { handle, process_id: 42, io };
        match behavior {
            Behavior::Complete | Behavior::Fail(_) => CallOutcome::Completed(process),
            Behavior::PendingFires(_) | Behavior::PendingSilent => CallOutcome::Pending(process),
        }
    }

    fn close_process(&self, process: ProcessHandle) -> Result<(), CallFailure> {
        self.record(Op::CloseProcess, process.as_raw());
        Ok(())
    }
}
