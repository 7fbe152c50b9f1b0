//! Control - step が返す制御シンボル

/// What the step loop should do after a step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Control {
    /// Advance to the next step.
    #[default]
    Next,

    /// Skip the remaining steps. Not an error.
    Abort,

    /// Invoke the same step again, bumping its retry counter.
    Retry,

    /// Skip the remaining steps and schedule the next run after the
    /// continue interval (when one is configured).
    Continue,

    /// Skip the remaining steps and mark the run as complete.
    Finish,
}

impl Control {
    /// Whether this symbol ends the current run's step iteration.
    pub fn stops_run(self) -> bool {
        matches!(self, Self::Abort | Self::Continue | Self::Finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Control::Next, false)]
    #[case(Control::Retry, false)]
    #[case(Control::Abort, true)]
    #[case(Control::Continue, true)]
    #[case(Control::Finish, true)]
    fn stops_run(#[case] control: Control, #[case] expected: bool) {
        assert_eq!(control.stops_run(), expected);
    }
}
