// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection managers: the framed proxy engine and the raw forwarding
//! engine. Each accepted connection becomes a task owning its context; the
//! explicit state machine below is the resumption skeleton the proxy
//! engine steps through.

pub mod forward;
pub mod proxy;

/// Result of stepping a state once.
pub enum Transition<S, R> {
    /// Move to the next state.
    Next(S, R),
    /// Re-enter the current state.
    Stay(R),
    /// The machine finished.
    Done(R),
}

/// A single state of a connection machine. States are stepped by the
/// context's `execute` loop; each step performs at most one logical I/O
/// operation, which keeps exactly one operation outstanding per context.
pub trait StateMachine<Ctx, Out>: Sized {
    type StepResult<'a>: Future<Output = Out> + Send + 'a
    where
        Self: 'a,
        Ctx: 'a,
        Out: 'a;

    fn step<'a>(&'a self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}
