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

//! Errors surfaced by the finality engine.
//!
//! Vote-level errors are swallowed after a log line (a single bad vote is
//! dropped, never retried at this layer); justification-level errors
//! propagate to the caller so the host can act on the offending peer.

use crate::primitives::BlockInfo;

/// Error type for the engine's fallible operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	/// A vote signature failed verification against the claimed voter.
	#[error("bad vote signature")]
	BadSignature,

	/// A vote was signed by a voter outside the round's voter set.
	#[error("vote from unknown voter")]
	UnknownVoter,

	/// A vote targeted a block below the round base.
	#[error("vote for a block lower than the round base")]
	VoteForLowerBlock,

	/// A vote targeted a block on a fork not descending from the round base.
	#[error("vote for a block that is not a descendant of the round base")]
	VoteNotDescendantOfBase,

	/// A voter cast two distinct votes of the same kind in one round.
	#[error("equivocated vote")]
	EquivocatedVote,

	/// A justification finalized a block below the already finalized one.
	#[error("justification for a block in the past")]
	JustificationForBlockInPast,

	/// A justification belonged to a round already completed in the
	/// current voter set.
	#[error("justification for a round in the past")]
	JustificationForRoundInPast,

	/// A justification belonged to an authority set older than the
	/// current one.
	#[error("justification for an authority set in the past")]
	JustificationForAuthoritySetInPast,

	/// A justification skipped ahead by more than one authority set.
	#[error("voter set id crossed by more than one increment")]
	WrongOrderOfVoterSetId,

	/// The host could not report an authority set for the target block.
	#[error("no known authorities for block {0}")]
	NoKnownAuthoritiesForBlock(BlockInfo),

	/// The precommit weight supporting the target block was below the
	/// supermajority threshold.
	#[error("insufficient precommit weight in justification")]
	InsufficientPrecommitWeight,

	/// A commit message carried precommit and auth-data vectors of
	/// different lengths.
	#[error("malformed commit: parallel vectors differ in length")]
	MalformedCommit,

	/// A stored justification could not be decoded.
	#[error("failed to decode stored justification")]
	JustificationDecode,

	/// The last finalized block has no stored justification.
	#[error("no justification stored for block {0}")]
	MissingJustification(BlockInfo),

	/// An authority appeared twice while building a voter set.
	#[error("duplicate voter in authority set")]
	DuplicateVoter,

	/// An authority set was empty or carried a zero total weight.
	#[error("invalid authority set")]
	InvalidAuthoritySet,
}
