//! Table-driven state machine engine shared by the sender and the receiver.
//!
//! A machine names its states with a closed enum. Every state declares which
//! successors its handler may return on success and where to go on failure.
//! The engine follows declared edges only; a handler that returns anything
//! else stops the run with [`FsmError::UndeclaredTransition`].

use crate::error::{FsmError, SessionError};
use crate::logger::{Logger, NoopLogger};
use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;

/// Declared edges out of one state.
#[derive(Debug, Clone, Copy)]
pub struct Transitions<S: 'static> {
    pub success: &'static [S],
    pub failure: S,
}

pub trait State: Copy + Eq + fmt::Debug + 'static {
    const INITIAL: Self;
    const ERROR: Self;
    const EXIT: Self;
    /// Every state of the machine, in any order.
    const ALL: &'static [Self];

    fn name(self) -> &'static str;
    fn transitions(self) -> Transitions<Self>;
}

/// A failure captured by the engine together with the state it came from.
#[derive(Debug)]
pub struct ErrorRecord<S> {
    pub state: S,
    pub error: SessionError,
}

impl<S: State> ErrorRecord<S> {
    pub fn describe(&self) -> String {
        format!(
            "{}\nOccurred in state {}.",
            self.error.describe(),
            self.state.name()
        )
    }
}

/// Per-session bookkeeping owned by a machine and updated by the engine.
pub struct SessionContext<S: State> {
    machine: &'static str,
    current: S,
    last_error: Option<ErrorRecord<S>>,
    failed: bool,
    trace: bool,
    logger: Arc<dyn Logger>,
}

impl<S: State> SessionContext<S> {
    pub fn new(machine: &'static str) -> Self {
        Self {
            machine,
            current: S::INITIAL,
            last_error: None,
            failed: false,
            trace: false,
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    pub fn set_logger(&mut self, logger: Arc<dyn Logger>) {
        self.logger = logger;
    }

    /// Log every state entry through the logger.
    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Hand out the captured error once; later calls return `None`.
    pub fn take_error(&mut self) -> Option<ErrorRecord<S>> {
        self.last_error.take()
    }

    fn enter(&mut self, state: S) {
        self.current = state;
        if self.trace {
            self.logger.state(self.machine, state.name());
        }
    }

    fn record(&mut self, state: S, error: SessionError) {
        self.failed = true;
        self.last_error = Some(ErrorRecord { state, error });
    }
}

pub trait Machine {
    type State: State;

    fn context(&mut self) -> &mut SessionContext<Self::State>;

    /// Do one unit of work for `state` and name the next state.
    fn handle(&mut self, state: Self::State) -> Result<Self::State, SessionError>;
}

/// How a run ended after reaching `Exit`.
#[derive(Debug)]
pub enum Completion<S> {
    Clean,
    /// Some handler failed. Carries the error if the `Error` state never
    /// reported it, e.g. when `Cleanup` itself failed.
    Failed(Option<ErrorRecord<S>>),
}

impl<S> Completion<S> {
    pub fn is_clean(&self) -> bool {
        matches!(self, Completion::Clean)
    }
}

impl<S: State> Completion<S> {
    /// Print anything the `Error` state never got to and map to an exit code.
    pub fn into_exit_code(self) -> ExitCode {
        match self {
            Completion::Clean => ExitCode::SUCCESS,
            Completion::Failed(unreported) => {
                if let Some(record) = unreported {
                    eprintln!("Error: {}", record.describe());
                }
                ExitCode::FAILURE
            }
        }
    }
}

/// Check that failures are funnelled through `ERROR`.
///
/// The teardown path is `ERROR` plus everything reachable from it on success
/// edges. Every state outside it must declare `ERROR` as its failure edge.
pub fn check_table<S: State>() -> Result<(), FsmError<S>> {
    let mut teardown = vec![S::ERROR];
    let mut i = 0;
    while i < teardown.len() {
        for &next in teardown[i].transitions().success {
            if !teardown.contains(&next) {
                teardown.push(next);
            }
        }
        i += 1;
    }
    for &state in S::ALL {
        let failure = state.transitions().failure;
        if !teardown.contains(&state) && failure != S::ERROR {
            return Err(FsmError::UnreportedFailure { state, failure });
        }
    }
    Ok(())
}

pub fn run<M: Machine>(machine: &mut M) -> Result<Completion<M::State>, FsmError<M::State>> {
    check_table::<M::State>()?;
    let mut state = <M::State as State>::INITIAL;
    loop {
        machine.context().enter(state);
        if state == <M::State as State>::EXIT {
            break;
        }
        let edges = state.transitions();
        match machine.handle(state) {
            Ok(next) if edges.success.contains(&next) => state = next,
            Ok(next) => {
                return Err(FsmError::UndeclaredTransition {
                    from: state,
                    to: next,
                })
            }
            Err(error) => {
                machine.context().record(state, error);
                state = edges.failure;
            }
        }
    }

    let ctx = machine.context();
    if ctx.failed() {
        Ok(Completion::Failed(ctx.take_error()))
    } else {
        Ok(Completion::Clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Toy {
        Start,
        Work,
        Error,
        Cleanup,
        Exit,
    }

    impl State for Toy {
        const INITIAL: Self = Toy::Start;
        const ERROR: Self = Toy::Error;
        const EXIT: Self = Toy::Exit;
        const ALL: &'static [Self] = &[Toy::Start, Toy::Work, Toy::Error, Toy::Cleanup, Toy::Exit];

        fn name(self) -> &'static str {
            match self {
                Toy::Start => "Start",
                Toy::Work => "Work",
                Toy::Error => "Error",
                Toy::Cleanup => "Cleanup",
                Toy::Exit => "Exit",
            }
        }

        fn transitions(self) -> Transitions<Self> {
            match self {
                Toy::Start => Transitions { success: &[Toy::Work], failure: Toy::Error },
                Toy::Work => Transitions { success: &[Toy::Work, Toy::Cleanup], failure: Toy::Error },
                Toy::Error => Transitions { success: &[Toy::Cleanup], failure: Toy::Cleanup },
                Toy::Cleanup => Transitions { success: &[Toy::Exit], failure: Toy::Exit },
                Toy::Exit => Transitions { success: &[], failure: Toy::Exit },
            }
        }
    }

    struct Counter {
        ctx: SessionContext<Toy>,
        rounds: u32,
        fail_at: Option<u32>,
        rogue: bool,
        visited: Vec<Toy>,
        reported: Option<String>,
    }

    impl Counter {
        fn new(fail_at: Option<u32>) -> Self {
            Self {
                ctx: SessionContext::new("toy"),
                rounds: 0,
                fail_at,
                rogue: false,
                visited: Vec::new(),
                reported: None,
            }
        }
    }

    impl Machine for Counter {
        type State = Toy;

        fn context(&mut self) -> &mut SessionContext<Toy> {
            &mut self.ctx
        }

        fn handle(&mut self, state: Toy) -> Result<Toy, SessionError> {
            self.visited.push(state);
            match state {
                Toy::Start if self.rogue => Ok(Toy::Exit),
                Toy::Start => Ok(Toy::Work),
                Toy::Work => {
                    self.rounds += 1;
                    if Some(self.rounds) == self.fail_at {
                        return Err(SessionError::new("work", "round failed"));
                    }
                    Ok(if self.rounds < 3 { Toy::Work } else { Toy::Cleanup })
                }
                Toy::Error => {
                    self.reported = self.ctx.take_error().map(|r| r.describe());
                    Ok(Toy::Cleanup)
                }
                Toy::Cleanup => Ok(Toy::Exit),
                Toy::Exit => unreachable!("exit has no handler"),
            }
        }
    }

    #[test]
    fn test_success_path() {
        let mut m = Counter::new(None);
        let done = run(&mut m).unwrap();
        assert!(done.is_clean());
        assert_eq!(
            m.visited,
            vec![Toy::Start, Toy::Work, Toy::Work, Toy::Work, Toy::Cleanup]
        );
        assert_eq!(m.ctx.current(), Toy::Exit);
    }

    #[test]
    fn test_failure_routes_through_error() {
        let mut m = Counter::new(Some(2));
        let done = run(&mut m).unwrap();
        // the Error state already reported it
        assert!(matches!(done, Completion::Failed(None)));
        assert_eq!(
            m.visited,
            vec![Toy::Start, Toy::Work, Toy::Work, Toy::Error, Toy::Cleanup]
        );
        let report = m.reported.unwrap();
        assert!(report.contains("round failed"));
        assert!(report.contains("state Work"));
        // origin and location appear once
        assert_eq!(report.matches("fsm.rs:").count(), 1);
        assert_eq!(report.matches("in work").count(), 1);
    }

    #[test]
    fn test_undeclared_successor_rejected() {
        let mut m = Counter::new(None);
        m.rogue = true;
        let err = run(&mut m).unwrap_err();
        assert!(matches!(
            err,
            FsmError::UndeclaredTransition { from: Toy::Start, to: Toy::Exit }
        ));
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Leaky {
        Start,
        Error,
        Exit,
    }

    impl State for Leaky {
        const INITIAL: Self = Leaky::Start;
        const ERROR: Self = Leaky::Error;
        const EXIT: Self = Leaky::Exit;
        const ALL: &'static [Self] = &[Leaky::Start, Leaky::Error, Leaky::Exit];

        fn name(self) -> &'static str {
            match self {
                Leaky::Start => "Start",
                Leaky::Error => "Error",
                Leaky::Exit => "Exit",
            }
        }

        fn transitions(self) -> Transitions<Self> {
            match self {
                // skips Error on failure
                Leaky::Start => Transitions { success: &[Leaky::Exit], failure: Leaky::Exit },
                Leaky::Error => Transitions { success: &[Leaky::Exit], failure: Leaky::Exit },
                Leaky::Exit => Transitions { success: &[], failure: Leaky::Exit },
            }
        }
    }

    #[test]
    fn test_table_must_funnel_failures_through_error() {
        assert!(check_table::<Toy>().is_ok());
        assert!(matches!(
            check_table::<Leaky>(),
            Err(FsmError::UnreportedFailure { state: Leaky::Start, failure: Leaky::Exit })
        ));
    }

    #[test]
    fn test_failure_is_logged_once() {
        use parking_lot::Mutex;

        #[derive(Default)]
        struct Errors(Mutex<Vec<String>>);
        impl Logger for Errors {
            fn error(&self, context: &str, msg: &str) {
                self.0.lock().push(format!("{}: {}", context, msg));
            }
        }

        let errors = Arc::new(Errors::default());
        let mut m = Counter::new(Some(1));
        m.ctx.set_logger(errors.clone());
        m.ctx.set_trace(true);
        run(&mut m).unwrap();
        // the Error handler is the only reporter
        assert!(errors.0.lock().is_empty());
        assert_eq!(m.reported.unwrap().matches("round failed").count(), 1);
    }
}
