// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire-level building blocks: the length-prefixed agent frame, the typed
//! field sub-codec, and the handful of agent messages the dispatcher
//! actually interprets.

pub mod agent;
pub mod frame;
pub mod wire;
