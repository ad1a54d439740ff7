use crate::board::{Board, RunStatus};
use crate::error::FixError;

type StepAction<C> = Box<dyn Fn(&mut C) -> Result<(), FixError> + Send>;

/// One named, independently failable unit of a pipeline over context `C`.
pub struct Step<C> {
    pub title: String,
    action: StepAction<C>,
}

impl<C> Step<C> {
    pub fn new<F>(title: &str, action: F) -> Self
    where
        F: Fn(&mut C) -> Result<(), FixError> + Send + 'static,
    {
        Self {
            title: title.to_string(),
            action: Box::new(action),
        }
    }
}

/// Runs every step in order. Each outcome lands in the run's step list; a
/// failing step flags the run and the next step still runs.
pub fn run_steps<C>(ctx: &mut C, steps: &[Step<C>], board: &Board) {
    for step in steps {
        board.set_status(&step.title, RunStatus::Running);
        board.log(&format!("== {} ==", step.title));

        match (step.action)(ctx) {
            Ok(()) => board.step_succeeded(&step.title),
            Err(err) => board.step_failed(&step.title, &err),
        }
    }
}
