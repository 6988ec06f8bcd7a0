//! JSON-RPC ledger client
//!
//! Talks to an Ethereum-compatible endpoint through an `alloy` HTTP provider
//! and maps provider failures onto [`LedgerError`] so the scanner can decide
//! whether to narrow, back off or skip.

use std::future::IntoFuture;
use std::time::Duration;

use alloy_primitives::{Address, BlockNumber, U256};
use alloy_provider::{Provider, ProviderBuilder, ReqwestProvider};
use alloy_rpc_types_eth::{Filter, TransactionInput, TransactionRequest};
use alloy_sol_types::{SolCall, SolEvent};
use alloy_transport::{RpcError, TransportError, TransportErrorKind, TransportResult};
use serde::Deserialize;
use tracing::debug;

use super::abi::{self, ICardNft, IPackManager};
use super::{LedgerClient, LedgerError};
use crate::packs::PendingPack;
use crate::types::{CardMetadata, ItemId, Subject, TransferDirection, TransferEvent};

/// JSON-RPC error code several providers use for "limit exceeded".
const LIMIT_EXCEEDED_CODE: i64 = -32005;

/// Phrases providers use when a `eth_getLogs` range is too wide.
const RANGE_ERROR_HINTS: &[&str] = &[
    "block range",
    "range too large",
    "range is too large",
    "too many blocks",
    "exceed maximum block range",
    "query returned more than",
    "limited to",
    "response size exceeded",
];

const RATE_LIMIT_HINTS: &[&str] = &["rate limit", "too many requests", "exceeded its compute units"];

const NONEXISTENT_HINTS: &[&str] = &["nonexistent", "invalid token id", "owner query for"];

/// Error object some providers put in the body of a non-2xx reply.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorObject,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

/// Ledger client backed by an HTTP JSON-RPC endpoint.
pub struct JsonRpcLedger {
    provider: ReqwestProvider,
    card_contract: Address,
    pack_contract: Option<Address>,
    request_timeout: Duration,
}

impl JsonRpcLedger {
    pub fn new(
        rpc_url: &str,
        card_contract: Address,
        pack_contract: Option<Address>,
        request_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let url: reqwest::Url = rpc_url
            .parse()
            .map_err(|e| LedgerError::Transport(format!("invalid rpc url {}: {}", rpc_url, e)))?;

        Ok(Self {
            provider: ProviderBuilder::new().on_http(url),
            card_contract,
            pack_contract,
            request_timeout,
        })
    }

    /// Await a provider call under the request timeout.
    async fn bounded<T, F>(&self, what: &'static str, call: F) -> Result<T, LedgerError>
    where
        F: IntoFuture<Output = TransportResult<T>>,
    {
        match tokio::time::timeout(self.request_timeout, call.into_future()).await {
            Ok(Ok(value)) => {
                debug!(call = what, "rpc call complete");
                Ok(value)
            }
            Ok(Err(e)) => Err(classify_transport_error(e)),
            Err(_) => Err(LedgerError::Timeout),
        }
    }

    /// `eth_call` against `contract` at the latest block.
    async fn view<C: SolCall>(&self, contract: Address, call: C) -> Result<C::Return, LedgerError> {
        let request = TransactionRequest::default()
            .to(contract)
            .input(TransactionInput::new(call.abi_encode().into()));
        let output = self.bounded(C::SIGNATURE, self.provider.call(&request)).await?;
        abi::decode_returns::<C>(&output)
    }

    /// Like [`Self::view`], mapping a revert to `NonexistentItem`.
    async fn item_view<C: SolCall>(&self, item: ItemId, call: C) -> Result<C::Return, LedgerError> {
        match self.view(self.card_contract, call).await {
            Err(LedgerError::Rpc { code, message }) if is_revert(code, &message) => {
                Err(LedgerError::NonexistentItem(item))
            }
            other => other,
        }
    }

    fn pack_contract(&self) -> Result<Address, LedgerError> {
        self.pack_contract
            .ok_or_else(|| LedgerError::Unsupported("no pack manager contract configured".into()))
    }
}

/// `Transfer` logs on `contract` with the subject as receiver or sender.
pub fn transfer_filter(
    contract: Address,
    direction: TransferDirection,
    subject: Subject,
    from: BlockNumber,
    to: BlockNumber,
) -> Filter {
    let filter = Filter::new()
        .address(contract)
        .event_signature(ICardNft::Transfer::SIGNATURE_HASH)
        .from_block(from)
        .to_block(to);
    match direction {
        TransferDirection::Incoming => filter.topic2(subject.into_word()),
        TransferDirection::Outgoing => filter.topic1(subject.into_word()),
    }
}

#[async_trait::async_trait]
impl LedgerClient for JsonRpcLedger {
    async fn tip(&self) -> Result<BlockNumber, LedgerError> {
        self.bounded("eth_blockNumber", self.provider.get_block_number())
            .await
    }

    async fn transfer_logs(
        &self,
        direction: TransferDirection,
        subject: Subject,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<TransferEvent>, LedgerError> {
        let filter = transfer_filter(self.card_contract, direction, subject, from, to);
        let logs = self
            .bounded("eth_getLogs", self.provider.get_logs(&filter))
            .await?;
        logs.iter().map(abi::decode_transfer).collect()
    }

    async fn balance_of(&self, subject: Subject) -> Result<u64, LedgerError> {
        let balance = self
            .view(self.card_contract, ICardNft::balanceOfCall { owner: subject })
            .await?
            .balance;
        u64::try_from(balance)
            .map_err(|_| LedgerError::Decode(format!("balance {} overflows u64", balance)))
    }

    async fn owner_of(&self, item: ItemId) -> Result<Address, LedgerError> {
        let owner = self
            .item_view(item, ICardNft::ownerOfCall { tokenId: item.as_u256() })
            .await?
            .owner;
        if owner == Address::ZERO {
            return Err(LedgerError::NonexistentItem(item));
        }
        Ok(owner)
    }

    async fn card_metadata(&self, item: ItemId) -> Result<CardMetadata, LedgerError> {
        let record = self
            .item_view(item, ICardNft::getCardMetadataCall { tokenId: item.as_u256() })
            .await?
            .record;
        Ok(record.into())
    }

    async fn user_pending_packs(&self, subject: Subject) -> Result<Vec<U256>, LedgerError> {
        let contract = self.pack_contract()?;
        let ids = self
            .view(contract, IPackManager::getUserPendingPacksCall { user: subject })
            .await?
            .requestIds;
        Ok(ids)
    }

    async fn pending_pack(&self, request_id: U256) -> Result<PendingPack, LedgerError> {
        let contract = self.pack_contract()?;
        let pack = self
            .view(contract, IPackManager::getPendingPackCall { requestId: request_id })
            .await?
            .pack;
        Ok(pack.into_pending(request_id))
    }
}

/// Map a provider failure onto the ledger error taxonomy.
pub fn classify_transport_error(e: TransportError) -> LedgerError {
    match e {
        RpcError::ErrorResp(payload) => classify_rpc_error(payload.code, &payload.message),
        RpcError::Transport(TransportErrorKind::HttpError(http)) => {
            if http.status == 429 {
                return LedgerError::RateLimited(format!("HTTP {}", http.status));
            }
            // Some providers answer range errors with a 400 and a JSON-RPC body
            match serde_json::from_str::<ErrorBody>(&http.body) {
                Ok(body) => classify_rpc_error(body.error.code, &body.error.message),
                Err(_) => LedgerError::Transport(format!("HTTP {}: {}", http.status, http.body)),
            }
        }
        RpcError::NullResp => LedgerError::Decode("null response".into()),
        RpcError::DeserError { err, .. } => LedgerError::Decode(err.to_string()),
        other => LedgerError::Transport(other.to_string()),
    }
}

/// Map a JSON-RPC error object onto the ledger error taxonomy.
pub fn classify_rpc_error(code: i64, message: &str) -> LedgerError {
    let lower = message.to_lowercase();

    if code == 429 || RATE_LIMIT_HINTS.iter().any(|h| lower.contains(h)) {
        return LedgerError::RateLimited(message.to_string());
    }
    if code == LIMIT_EXCEEDED_CODE || RANGE_ERROR_HINTS.iter().any(|h| lower.contains(h)) {
        return LedgerError::RangeTooWide(message.to_string());
    }

    LedgerError::Rpc {
        code,
        message: message.to_string(),
    }
}

fn is_revert(code: i64, message: &str) -> bool {
    let lower = message.to_lowercase();
    code == 3 || lower.contains("revert") || NONEXISTENT_HINTS.iter().any(|h| lower.contains(h))
}
