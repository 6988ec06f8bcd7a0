//! Contract interfaces the ledger client calls, and their conversions into
//! crate types

use alloy_primitives::U256;
use alloy_rpc_types_eth::Log;
use alloy_sol_types::{sol, SolCall, SolEvent};

use super::LedgerError;
use crate::packs::PendingPack;
use crate::types::{CardMetadata, ItemId, TransferEvent};

sol! {
    /// ERC-721 card contract with an on-chain metadata view.
    interface ICardNft {
        struct CardRecord {
            uint256 playerId;
            uint8 rarity;
            uint64 mintTimestamp;
            string metadataURI;
        }

        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

        function balanceOf(address owner) external view returns (uint256 balance);
        function ownerOf(uint256 tokenId) external view returns (address owner);
        function getCardMetadata(uint256 tokenId) external view returns (CardRecord memory record);
    }

    /// Pack manager holding packs waiting on randomness.
    interface IPackManager {
        struct PackRecord {
            address buyer;
            uint8 packType;
            uint256[] playerIds;
            uint8[] rarities;
            bool fulfilled;
        }

        function getUserPendingPacks(address user) external view returns (uint256[] memory requestIds);
        function getPendingPack(uint256 requestId) external view returns (PackRecord memory pack);
    }
}

impl From<ICardNft::CardRecord> for CardMetadata {
    fn from(record: ICardNft::CardRecord) -> Self {
        Self {
            player_id: record.playerId,
            rarity: record.rarity,
            mint_timestamp: record.mintTimestamp,
            metadata_uri: record.metadataURI,
        }
    }
}

impl IPackManager::PackRecord {
    pub fn into_pending(self, request_id: U256) -> PendingPack {
        PendingPack {
            request_id,
            pack_type: self.packType,
            buyer: self.buyer,
            player_ids: self.playerIds,
            rarities: self.rarities,
            fulfilled: self.fulfilled,
        }
    }
}

/// Decode and validate the return data of `C`.
pub fn decode_returns<C: SolCall>(data: &[u8]) -> Result<C::Return, LedgerError> {
    C::abi_decode_returns(data, true)
        .map_err(|e| LedgerError::Decode(format!("{}: {}", C::SIGNATURE, e)))
}

/// Turn a mined `Transfer` log into a [`TransferEvent`].
pub fn decode_transfer(log: &Log) -> Result<TransferEvent, LedgerError> {
    let block = log
        .block_number
        .ok_or_else(|| LedgerError::Decode("pending log has no block number".into()))?;
    let transfer = ICardNft::Transfer::decode_log(&log.inner, true)
        .map_err(|e| LedgerError::Decode(format!("transfer log: {}", e)))?
        .data;

    Ok(TransferEvent {
        from: transfer.from,
        to: transfer.to,
        item_id: ItemId(transfer.tokenId),
        block,
    })
}
