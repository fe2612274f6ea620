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

//! Primitives for the GRANDPA finality engine: block references, authority
//! identities, the three vote kinds and their signed forms, and the
//! localized signing payload shared by all of them.

use std::fmt;

use ed25519_dalek::{Signature as EdSignature, Signer, SigningKey, VerifyingKey};
use parity_scale_codec::{Decode, Encode};
use primitive_types::{H256, H512};

/// The hash of a block.
pub type BlockHash = H256;

/// The number of a block.
pub type BlockNumber = u64;

/// The monotonic identifier of a GRANDPA authority set.
pub type SetId = u64;

/// The round indicator.
pub type RoundNumber = u64;

/// The voting weight of an authority.
pub type AuthorityWeight = u64;

/// A list of authorities with associated weights.
pub type AuthorityList = Vec<(AuthorityId, AuthorityWeight)>;

/// A keypair used to sign votes. Nodes without one act as observers.
pub type Keypair = SigningKey;

/// Hash and number identifying a block in the tree.
///
/// Blocks are ordered by number first; the hash disambiguates forks at the
/// same height.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct BlockInfo {
	/// The hash of the block.
	pub hash: BlockHash,
	/// The number of the block.
	pub number: BlockNumber,
}

impl BlockInfo {
	/// Create a new block reference.
	pub fn new(hash: BlockHash, number: BlockNumber) -> Self {
		BlockInfo { hash, number }
	}
}

impl PartialOrd for BlockInfo {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for BlockInfo {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.number.cmp(&other.number).then_with(|| self.hash.cmp(&other.hash))
	}
}

impl fmt::Display for BlockInfo {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{} (#{})", self.hash, self.number)
	}
}

impl fmt::Debug for BlockInfo {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{} (#{})", self.hash, self.number)
	}
}

/// Identity of a GRANDPA authority: an Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct AuthorityId(pub [u8; 32]);

impl AuthorityId {
	/// The id under which the given keypair signs.
	pub fn from_keypair(keypair: &Keypair) -> Self {
		AuthorityId(keypair.verifying_key().to_bytes())
	}
}

impl From<[u8; 32]> for AuthorityId {
	fn from(raw: [u8; 32]) -> Self {
		AuthorityId(raw)
	}
}

impl fmt::Display for AuthorityId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", H256(self.0))
	}
}

impl fmt::Debug for AuthorityId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", H256(self.0))
	}
}

/// Signature of an authority over a localized vote payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct AuthoritySignature(pub [u8; 64]);

impl fmt::Debug for AuthoritySignature {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", H512(self.0))
	}
}

/// An authority set as reported by the host for some block, together with
/// its monotonic set id.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AuthoritySet {
	/// The id of the set. Crossing set boundaries resets round numbering.
	pub id: SetId,
	/// The authorities of the set along with their weights.
	pub authorities: AuthorityList,
}

/// A prevote for a block and its ancestors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Prevote {
	/// The target block's hash.
	pub target_hash: BlockHash,
	/// The target block's number.
	pub target_number: BlockNumber,
}

impl Prevote {
	/// Create a new prevote for the given block.
	pub fn new(target_hash: BlockHash, target_number: BlockNumber) -> Self {
		Prevote { target_hash, target_number }
	}

	/// The block this prevote is for.
	pub fn target(&self) -> BlockInfo {
		BlockInfo::new(self.target_hash, self.target_number)
	}
}

/// A precommit for a block and its ancestors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Precommit {
	/// The target block's hash.
	pub target_hash: BlockHash,
	/// The target block's number.
	pub target_number: BlockNumber,
}

impl Precommit {
	/// Create a new precommit for the given block.
	pub fn new(target_hash: BlockHash, target_number: BlockNumber) -> Self {
		Precommit { target_hash, target_number }
	}

	/// The block this precommit is for.
	pub fn target(&self) -> BlockInfo {
		BlockInfo::new(self.target_hash, self.target_number)
	}
}

/// A primary proposal: a broadcast of the previous round's estimate by the
/// round's primary voter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct PrimaryPropose {
	/// The target block's hash.
	pub target_hash: BlockHash,
	/// The target block's number.
	pub target_number: BlockNumber,
}

impl PrimaryPropose {
	/// Create a new proposal of the given block.
	pub fn new(target_hash: BlockHash, target_number: BlockNumber) -> Self {
		PrimaryPropose { target_hash, target_number }
	}

	/// The block this proposal is for.
	pub fn target(&self) -> BlockInfo {
		BlockInfo::new(self.target_hash, self.target_number)
	}
}

/// A protocol vote. The variant indices are the wire tags: 0 for a primary
/// proposal, 1 for a prevote, 2 for a precommit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Message {
	/// A primary proposal.
	PrimaryPropose(PrimaryPropose),
	/// A prevote.
	Prevote(Prevote),
	/// A precommit.
	Precommit(Precommit),
}

impl Message {
	/// The block the vote targets.
	pub fn target(&self) -> BlockInfo {
		match self {
			Message::PrimaryPropose(propose) => propose.target(),
			Message::Prevote(prevote) => prevote.target(),
			Message::Precommit(precommit) => precommit.target(),
		}
	}

	/// The name of the vote kind, for logging.
	pub fn kind(&self) -> &'static str {
		match self {
			Message::PrimaryPropose(_) => "PrimaryPropose",
			Message::Prevote(_) => "Prevote",
			Message::Precommit(_) => "Precommit",
		}
	}
}

/// A vote attributed to a voter by a signature over the localized payload.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SignedMessage {
	/// The vote itself.
	pub message: Message,
	/// The id of the signer.
	pub id: AuthorityId,
	/// The signature on the localized payload.
	pub signature: AuthoritySignature,
}

impl SignedMessage {
	/// The block the vote targets.
	pub fn target(&self) -> BlockInfo {
		self.message.target()
	}
}

/// A signed precommit, as carried in commits and justifications.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SignedPrecommit {
	/// The precommit which has been signed.
	pub precommit: Precommit,
	/// The id of the signer.
	pub id: AuthorityId,
	/// The signature on the localized payload.
	pub signature: AuthoritySignature,
}

impl From<SignedPrecommit> for SignedMessage {
	fn from(signed: SignedPrecommit) -> Self {
		SignedMessage {
			message: Message::Precommit(signed.precommit),
			id: signed.id,
			signature: signed.signature,
		}
	}
}

/// An equivocation: two distinct votes of the same kind by one voter in
/// one round.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Equivocation<V> {
	/// The round the equivocation happened in.
	pub round_number: RoundNumber,
	/// The identity of the equivocator.
	pub identity: AuthorityId,
	/// The first vote seen.
	pub first: (V, AuthoritySignature),
	/// The second, conflicting vote.
	pub second: (V, AuthoritySignature),
}

/// Encode a round message localized to the given round and set id. This is
/// the exact payload signatures are made over.
pub fn localized_payload<E: Encode>(round: RoundNumber, set_id: SetId, message: &E) -> Vec<u8> {
	(message, round, set_id).encode()
}

/// Sign a vote localized to the given round and set id.
pub fn sign_message(
	keypair: &Keypair,
	message: Message,
	round: RoundNumber,
	set_id: SetId,
) -> SignedMessage {
	let payload = localized_payload(round, set_id, &message);
	let signature = AuthoritySignature(keypair.sign(&payload).to_bytes());

	SignedMessage { message, id: AuthorityId::from_keypair(keypair), signature }
}

/// Check a vote signature by reconstructing the localized payload and
/// verifying it against the claimed authority id.
pub fn check_message_signature(
	message: &Message,
	id: &AuthorityId,
	signature: &AuthoritySignature,
	round: RoundNumber,
	set_id: SetId,
) -> bool {
	let key = match VerifyingKey::from_bytes(&id.0) {
		Ok(key) => key,
		Err(_) => return false,
	};

	let payload = localized_payload(round, set_id, message);
	key.verify_strict(&payload, &EdSignature::from_bytes(&signature.0)).is_ok()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::keypair;

	#[test]
	fn sign_and_check_roundtrip() {
		let pair = keypair(1);
		let message = Message::Prevote(Prevote::new(H256::repeat_byte(0xab), 10));

		let signed = sign_message(&pair, message.clone(), 42, 7);

		assert_eq!(signed.id, AuthorityId::from_keypair(&pair));
		assert!(check_message_signature(&message, &signed.id, &signed.signature, 42, 7));
	}

	#[test]
	fn signature_is_localized_to_round_and_set() {
		let pair = keypair(1);
		let message = Message::Precommit(Precommit::new(H256::repeat_byte(0xcd), 3));

		let signed = sign_message(&pair, message.clone(), 5, 1);

		assert!(!check_message_signature(&message, &signed.id, &signed.signature, 6, 1));
		assert!(!check_message_signature(&message, &signed.id, &signed.signature, 5, 2));
	}

	#[test]
	fn signature_does_not_transfer_between_voters() {
		let message = Message::Prevote(Prevote::new(H256::repeat_byte(0x11), 1));
		let signed = sign_message(&keypair(1), message.clone(), 1, 0);
		let other = AuthorityId::from_keypair(&keypair(2));

		assert!(!check_message_signature(&message, &other, &signed.signature, 1, 0));
	}

	#[test]
	fn localized_payload_layout() {
		let message = Message::Prevote(Prevote::new(H256::repeat_byte(0x01), 9));
		let payload = localized_payload(4, 2, &message);

		let mut expected = message.encode();
		expected.extend(4u64.encode());
		expected.extend(2u64.encode());

		assert_eq!(payload, expected);
	}

	#[test]
	fn message_wire_tags() {
		let propose =
			Message::PrimaryPropose(PrimaryPropose::new(H256::zero(), 0)).encode();
		let prevote = Message::Prevote(Prevote::new(H256::zero(), 0)).encode();
		let precommit = Message::Precommit(Precommit::new(H256::zero(), 0)).encode();

		assert_eq!(propose[0], 0);
		assert_eq!(prevote[0], 1);
		assert_eq!(precommit[0], 2);
	}

	#[test]
	fn block_info_orders_by_number_then_hash() {
		let a = BlockInfo::new(H256::repeat_byte(0x02), 5);
		let b = BlockInfo::new(H256::repeat_byte(0x01), 6);
		let c = BlockInfo::new(H256::repeat_byte(0x03), 5);

		assert!(a < b);
		assert!(a < c);
	}
}
