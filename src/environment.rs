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

//! The boundary between the engine and its host.
//!
//! The engine is single-threaded and effect-free by itself: every outward
//! action (gossip, block-tree queries, sync requests, timers) goes through
//! the [`Environment`] trait, and every deferred completion comes back in
//! through a `Voter` entry point (`on_alarm`, `on_block_synced`). Timers
//! are semantic tokens rather than callbacks so that tests can drive the
//! engine with a virtual clock.

use std::{collections::BTreeSet, fmt, hash::Hash, time::Duration};

use crate::{
	communication::{CatchUpResponse, NeighborPacket},
	error::Error,
	justification::GrandpaJustification,
	primitives::{
		AuthoritySet, BlockHash, BlockInfo, RoundNumber, SetId, SignedMessage,
	},
	round::MovableRoundState,
};

/// Failure of an ancestry lookup against the block tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
	/// The block does not descend from the given base.
	#[error("block not a descendant of base")]
	NotDescendent,

	/// The walk met a block the local tree does not know yet. The number
	/// is the host's best knowledge of the block's height (typically one
	/// below the last known child on the walk).
	#[error("ancestry walk hit unknown block {0}")]
	MissingBlock(BlockInfo),
}

/// Read access to the block tree.
pub trait Chain {
	/// The hashes strictly between `block` and `base`, in reverse order
	/// starting from `block`'s parent and excluding both endpoints.
	fn ancestry(&self, base: BlockHash, block: BlockHash) -> Result<Vec<BlockHash>, ChainError>;

	/// The head of the best chain containing the given block, or `None` if
	/// the block is unknown.
	fn best_chain_containing(&self, base: BlockInfo) -> Option<BlockInfo>;

	/// Whether `block` is equal to or a descendant of `base`.
	fn is_equal_or_descendent_of(&self, base: BlockHash, block: BlockHash) -> bool {
		base == block || self.ancestry(base, block).is_ok()
	}
}

/// A timer the engine asks the host to arm. Due alarms are delivered back
/// through `Voter::on_alarm`; alarms for rounds no longer in the chain are
/// ignored there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alarm {
	/// Cast the prevote of the given round.
	Prevote(RoundNumber),
	/// Cast the precommit of the given round.
	Precommit(RoundNumber),
	/// Rebroadcast the neighbor packet if no round change happened.
	Rebroadcast,
}

/// Handle to a scheduled alarm, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmToken(pub u64);

/// Scratch state threaded through one ingest call. Ancestry misses during
/// vote-graph insertion land here instead of failing the call; the voter
/// drains the set through block sync and then re-dispatches the message
/// that hit them.
#[derive(Debug, Default)]
pub struct GrandpaContext {
	/// Blocks referenced by the ingested message but unknown to the local
	/// tree, ordered by number so the deepest is fetched first.
	pub missing_blocks: BTreeSet<BlockInfo>,
}

/// Everything the engine needs from the outside world.
pub trait Environment: Chain {
	/// Transport-owned peer identity.
	type PeerId: Clone + Eq + Hash + fmt::Debug;

	/// Gossip a signed prevote of the given round.
	fn send_prevote(&self, round: RoundNumber, set_id: SetId, vote: SignedMessage);

	/// Gossip a signed precommit of the given round.
	fn send_precommit(&self, round: RoundNumber, set_id: SetId, vote: SignedMessage);

	/// Gossip a signed primary proposal of the given round.
	fn send_primary_propose(&self, round: RoundNumber, set_id: SetId, vote: SignedMessage);

	/// Broadcast our view to all peers.
	fn send_neighbor(&self, packet: NeighborPacket);

	/// Share a round's known votes with a single peer that has just
	/// reached it.
	fn send_state(&self, who: &Self::PeerId, state: MovableRoundState, set_id: SetId);

	/// Answer a catch-up request.
	fn send_catch_up_response(&self, who: &Self::PeerId, response: CatchUpResponse);

	/// Issue a catch-up request to the given peer.
	fn on_catch_up_requested(
		&self,
		who: &Self::PeerId,
		set_id: SetId,
		round: RoundNumber,
	) -> Result<(), Error>;

	/// A block reached finality. The host must store the justification
	/// with the block; it is read back on restart.
	fn on_finalized(&self, block: BlockInfo, justification: &GrandpaJustification);

	/// Ask the synchronizer to fetch justifications for the finalized
	/// range `(from, to]`, from the given peer.
	fn sync_missing_justifications(
		&self,
		who: &Self::PeerId,
		from: BlockInfo,
		to: Option<BlockInfo>,
	);

	/// Ask the synchronizer to fetch the given block (and whatever of its
	/// ancestry is missing) from the given peer. Completion is reported
	/// through `Voter::on_block_synced`.
	fn sync_by_block_info(&self, block: BlockInfo, who: &Self::PeerId, best_effort: bool);

	/// Arm a timer. The host delivers the alarm back once `after` has
	/// elapsed, unless cancelled.
	fn schedule_alarm(&self, after: Duration, alarm: Alarm) -> AlarmToken;

	/// Cancel a previously scheduled alarm.
	fn cancel_alarm(&self, token: AlarmToken);

	/// The authority set active at the given block. `is_finalized` tells
	/// the host whether the block is already finalized.
	fn authorities_at(&self, block: BlockInfo, is_finalized: bool) -> Option<AuthoritySet>;

	/// The last finalized block of the tree.
	fn last_finalized(&self) -> BlockInfo;

	/// The head of the best (deepest) chain of the tree.
	fn best_block(&self) -> BlockInfo;

	/// The stored justification for the given finalized block, if any.
	fn justification(&self, block: BlockHash) -> Option<Vec<u8>>;
}
