// Copyright 2019-2022 Parity Technologies (UK) Ltd
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A GRANDPA-style finality engine for a block tree produced by some
//! external block-production consensus.
//!
//! GRANDPA votes on chains, not blocks: once a block is final, all of its
//! ancestors are final. The engine drives a sequence of voting rounds,
//! each passing through a prevote and a precommit stage; a block is
//! finalized when more than two thirds of the voter weight precommits to a
//! descendant of a block that more than two thirds prevoted for. The proof
//! of that — a [`justification::GrandpaJustification`] — is handed to the
//! host for storage and gossiped to peers.
//!
//! The engine is transport- and storage-agnostic: everything it needs from
//! the outside world sits behind [`environment::Environment`], and it runs
//! entirely on one executor. Peer messages enter through the
//! [`voter::Voter`]'s `on_*` entry points, timers through `on_alarm`, and
//! sync completions through `on_block_synced`. Nothing but justifications
//! is ever persisted; on restart the voter reconstructs its initial round
//! from the last stored justification.

pub mod communication;
pub mod environment;
pub mod error;
pub mod justification;
pub mod primitives;
pub mod round;
pub mod vote_graph;
pub mod voter;
pub mod voter_set;
pub mod voting_round;

#[cfg(test)]
pub(crate) mod testing;

pub use communication::{
	CatchUpRequest, CatchUpResponse, FullCommitMessage, NeighborPacket, VoteMessage,
};
pub use environment::{Alarm, AlarmToken, Chain, ChainError, Environment, GrandpaContext};
pub use error::Error;
pub use justification::GrandpaJustification;
pub use primitives::{
	AuthorityId, AuthorityList, AuthoritySet, AuthoritySignature, AuthorityWeight, BlockHash,
	BlockInfo, BlockNumber, Keypair, Message, Precommit, Prevote, PrimaryPropose, RoundNumber,
	SetId, SignedMessage, SignedPrecommit,
};
pub use round::{MovableRoundState, RoundState};
pub use voter::{Config, Voter, CATCH_UP_THRESHOLD, KEEP_RECENT_ROUNDS};
pub use voter_set::VoterSet;
pub use voting_round::VotingRound;
