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

//! GRANDPA justifications: a set of signed precommits carrying enough
//! weight to prove the finality of one block.
//!
//! This is what gets stored with a finalized block, read back on restart,
//! and reconstructed from commit messages arriving over gossip.

use std::collections::HashSet;

use log::debug;
use parity_scale_codec::{Decode, Encode};

use crate::{
	communication::FullCommitMessage,
	environment::{Chain, ChainError, GrandpaContext},
	error::Error,
	primitives::{check_message_signature, BlockInfo, Message, RoundNumber, SignedPrecommit},
	voter_set::VoterSet,
};

/// A proof of finality for one block: the round it was decided in and the
/// signed precommits that carry supermajority weight for it.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct GrandpaJustification {
	/// The round the block was finalized in.
	pub round_number: RoundNumber,
	/// The finalized block.
	pub block: BlockInfo,
	/// The precommits proving it, both halves of equivocations included.
	pub items: Vec<SignedPrecommit>,
}

impl GrandpaJustification {
	/// Rebuild a justification from a commit message. The parallel vote
	/// and signer vectors must match up.
	pub fn from_commit(msg: &FullCommitMessage) -> Result<Self, Error> {
		if msg.precommits.len() != msg.auth_data.len() {
			return Err(Error::MalformedCommit)
		}

		let items = msg
			.precommits
			.iter()
			.zip(&msg.auth_data)
			.map(|(precommit, (signature, id))| SignedPrecommit {
				precommit: precommit.clone(),
				id: *id,
				signature: *signature,
			})
			.collect();

		Ok(GrandpaJustification { round_number: msg.round, block: msg.target, items })
	}

	/// The block this justification proves final.
	pub fn target(&self) -> BlockInfo {
		self.block
	}

	/// Check that the justification carries supermajority precommit weight
	/// for its block under the given voter set.
	///
	/// Every signature must verify. A voter's weight counts once, as soon
	/// as any of its precommits targets the block or a descendant of it;
	/// equivocations are tolerated and do not double-count. Ancestry gaps
	/// are collected into the context so the caller can sync and retry.
	pub fn verify<C: Chain + ?Sized>(
		&self,
		voters: &VoterSet,
		chain: &C,
		context: &mut GrandpaContext,
	) -> Result<(), Error> {
		let mut weight = 0u64;
		let mut counted = HashSet::new();

		for item in &self.items {
			let message = Message::Precommit(item.precommit.clone());
			if !check_message_signature(
				&message,
				&item.id,
				&item.signature,
				self.round_number,
				voters.id(),
			) {
				return Err(Error::BadSignature)
			}

			let voter_weight = match voters.weight_of(&item.id) {
				Some(voter_weight) => voter_weight,
				None => {
					debug!(
						target: "afg",
						"Justification for block {} carries precommit of unknown voter {}",
						self.block,
						item.id,
					);
					continue
				},
			};

			if item.precommit.target_number < self.block.number {
				continue
			}

			let supports = item.precommit.target_hash == self.block.hash ||
				match chain.ancestry(self.block.hash, item.precommit.target_hash) {
					Ok(_) => true,
					Err(ChainError::MissingBlock(block)) => {
						context.missing_blocks.insert(block);
						false
					},
					Err(ChainError::NotDescendent) => false,
				};

			if supports && counted.insert(item.id) {
				weight += voter_weight;
			}
		}

		if weight < voters.threshold() {
			return Err(Error::InsufficientPrecommitWeight)
		}

		Ok(())
	}
}
