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

//! Wire messages of the polite-grandpa networking protocol.
//!
//! Rather than expressing protocol rules, polite-grandpa carries a notion
//! of impoliteness: out-of-scope messages are dropped (and logged) instead
//! of being answered. The politeness rules themselves live with the voter;
//! this module only defines the message shapes as they travel, all
//! SCALE-encoded.

use parity_scale_codec::{Decode, Encode};

use crate::primitives::{
	AuthorityId, AuthoritySignature, BlockInfo, Precommit, RoundNumber, SetId, SignedMessage,
};

/// The neighbor protocol version spoken by this implementation.
pub const NEIGHBOR_PROTOCOL_VERSION: u8 = 1;

/// A single vote of any kind, attributed to a round and voter set.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct VoteMessage {
	/// The voter set the vote belongs to.
	pub set_id: SetId,
	/// The round the vote belongs to.
	pub round: RoundNumber,
	/// The signed vote itself.
	pub message: SignedMessage,
}

/// An aggregate of precommits finalizing a block, in compact form: the
/// `precommits` and `auth_data` vectors are parallel.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FullCommitMessage {
	/// The voter set the commit belongs to.
	pub set_id: SetId,
	/// The round the commit belongs to.
	pub round: RoundNumber,
	/// The block the commit finalizes.
	pub target: BlockInfo,
	/// The precommits justifying the target.
	pub precommits: Vec<Precommit>,
	/// Signature and signer of each precommit, in the same order.
	pub auth_data: Vec<(AuthoritySignature, AuthorityId)>,
}

/// Periodic announcement of a node's view: its set, round and finalized
/// height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct NeighborPacket {
	/// The neighbor protocol version.
	pub version: u8,
	/// The sender's voter set id.
	pub set_id: SetId,
	/// The round the sender is at.
	pub round: RoundNumber,
	/// The height of the sender's last finalized block.
	pub last_finalized: u32,
}

/// A request to be caught up to the given round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct CatchUpRequest {
	/// The round to catch up to.
	pub round: RoundNumber,
	/// The voter set the requester is in.
	pub set_id: SetId,
}

/// The answer to a [`CatchUpRequest`]: enough votes of the target round to
/// reconstruct its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CatchUpResponse {
	/// The voter set the round belongs to.
	pub set_id: SetId,
	/// The round being caught up to.
	pub round: RoundNumber,
	/// Prevotes establishing the round's prevote ghost.
	pub prevote_justification: Vec<SignedMessage>,
	/// Precommits establishing the round's finalized block.
	pub precommit_justification: Vec<SignedMessage>,
	/// The best block the responder saw finalized in that round.
	pub best_final_candidate: BlockInfo,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		primitives::{sign_message, Message, Prevote},
		testing::{hash, keypair},
	};

	#[test]
	fn vote_message_roundtrip() {
		let signed =
			sign_message(&keypair(1), Message::Prevote(Prevote::new(hash(3), 3)), 9, 2);
		let message = VoteMessage { set_id: 2, round: 9, message: signed };

		let encoded = message.encode();
		assert_eq!(VoteMessage::decode(&mut &encoded[..]), Ok(message));
	}

	#[test]
	fn vote_message_layout_starts_with_set_id_and_round() {
		let signed =
			sign_message(&keypair(1), Message::Prevote(Prevote::new(hash(3), 3)), 9, 2);
		let encoded = VoteMessage { set_id: 2, round: 9, message: signed }.encode();

		assert_eq!(&encoded[0..8], &2u64.encode()[..]);
		assert_eq!(&encoded[8..16], &9u64.encode()[..]);
		// the vote tag follows: 1 for a prevote.
		assert_eq!(encoded[16], 1);
	}

	#[test]
	fn neighbor_packet_roundtrip() {
		let packet = NeighborPacket {
			version: NEIGHBOR_PROTOCOL_VERSION,
			set_id: 4,
			round: 17,
			last_finalized: 1000,
		};

		let encoded = packet.encode();
		assert_eq!(encoded.len(), 1 + 8 + 8 + 4);
		assert_eq!(NeighborPacket::decode(&mut &encoded[..]), Ok(packet));
	}

	#[test]
	fn catch_up_request_roundtrip() {
		let request = CatchUpRequest { round: 19, set_id: 7 };
		let encoded = request.encode();
		assert_eq!(CatchUpRequest::decode(&mut &encoded[..]), Ok(request));
	}
}
