// src/chain/evm.rs
use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolCall;
use alloy::transports::TransportError;
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::tx::TxState;

use super::{Chain, ChainError, FeeEstimate, Fees, OnChainValue, ReceiptStatus, ReportTx, StakeInfo};

sol! {
    #[sol(rpc)]
    interface ITellorOracle {
        function submitValue(bytes32 _queryId, bytes calldata _value, uint256 _nonce, bytes calldata _queryData) external;
        function getNewValueCountbyQueryId(bytes32 _queryId) external view returns (uint256);
        function getStakerInfo(address _stakerAddress) external view returns (uint256, uint256, uint256, uint256, uint256, uint256, uint256, uint256, bool);
        function getDataBefore(bytes32 _queryId, uint256 _timestamp) external view returns (bool _ifRetrieve, bytes memory _value, uint256 _timestampRetrieved);
    }
}

fn rpc_err(e: TransportError) -> ChainError {
    match e.as_error_resp() {
        Some(payload) => ChainError::classify(&payload.message.to_string()),
        None => ChainError::Network(e.to_string()),
    }
}

fn contract_err(e: alloy::contract::Error) -> ChainError {
    match e {
        alloy::contract::Error::TransportError(t) => rpc_err(t),
        other => ChainError::Rpc(other.to_string()),
    }
}

/// JSON-RPC chain access for one local signing key against one oracle contract.
pub struct EvmChain<P> {
    provider: P,
    wallet: EthereumWallet,
    address: Address,
    oracle: Address,
    chain_id: u64,
}

impl<P: Provider + Clone + 'static> EvmChain<P> {
    pub fn new(provider: P, signer: PrivateKeySigner, oracle: Address, chain_id: u64) -> Self {
        let address = signer.address();
        Self { provider, wallet: EthereumWallet::from(signer), address, oracle, chain_id }
    }
}

/// HTTP provider for `rpc_url`.
pub fn connect(
    rpc_url: &str,
    signer: PrivateKeySigner,
    oracle: Address,
    chain_id: u64,
) -> Result<EvmChain<impl Provider + Clone + 'static>, ChainError> {
    let url = rpc_url.parse().map_err(|e| ChainError::Rpc(format!("bad rpc url {rpc_url:?}: {e}")))?;
    let provider = ProviderBuilder::new().on_http(url);
    Ok(EvmChain::new(provider, signer, oracle, chain_id))
}

#[async_trait]
impl<P: Provider + Clone + 'static> Chain for EvmChain<P> {
    fn address(&self) -> Address { self.address }

    async fn sign_and_send(&self, tx: &ReportTx) -> Result<B256, ChainError> {
        let input = ITellorOracle::submitValueCall {
            _queryId: tx.query_id,
            _value: tx.value.clone(),
            _nonce: tx.report_nonce,
            _queryData: tx.query_data.clone(),
        }
        .abi_encode();

        let mut req = TransactionRequest::default()
            .with_from(self.address)
            .with_to(self.oracle)
            .with_input(input)
            .with_nonce(tx.nonce)
            .with_chain_id(self.chain_id)
            .with_gas_limit(tx.gas_limit);
        match tx.fees {
            Fees::Legacy { gas_price } => req.set_gas_price(gas_price),
            Fees::Eip1559 { max_fee, priority_fee } => {
                req.set_max_fee_per_gas(max_fee);
                req.set_max_priority_fee_per_gas(priority_fee);
            }
        }

        let envelope = req.build(&self.wallet).await.map_err(|e| ChainError::Rpc(format!("signing failed: {e}")))?;
        let hash = *envelope.tx_hash();
        let raw = envelope.encoded_2718();
        debug!(%hash, nonce = tx.nonce, state = TxState::Signed.as_str(), "report transaction signed");
        match self.provider.send_raw_transaction(&raw).await {
            Ok(_) => Ok(hash),
            // a retried broadcast of the same bytes
            Err(e) if e.to_string().to_lowercase().contains("already known") => Ok(hash),
            Err(e) => Err(rpc_err(e)),
        }
    }

    async fn receipt(&self, hash: B256) -> Result<ReceiptStatus, ChainError> {
        let receipt = self.provider.get_transaction_receipt(hash).await.map_err(rpc_err)?;
        Ok(match receipt {
            None => ReceiptStatus::Pending,
            Some(r) => {
                let block = r.block_number().unwrap_or_default();
                if r.status() { ReceiptStatus::Confirmed { block } } else { ReceiptStatus::Failed { block } }
            }
        })
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        self.provider.get_transaction_count(self.address).pending().await.map_err(rpc_err)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(rpc_err)
    }

    async fn fee_estimate(&self) -> Result<FeeEstimate, ChainError> {
        let gas_price = self.provider.get_gas_price().await.map_err(rpc_err)?;
        let priority_fee = self.provider.get_max_priority_fee_per_gas().await.map_err(rpc_err)?;
        Ok(FeeEstimate { base_fee: gas_price.saturating_sub(priority_fee), priority_fee })
    }

    async fn native_balance(&self) -> Result<U256, ChainError> {
        self.provider.get_balance(self.address).await.map_err(rpc_err)
    }

    async fn stake_info(&self) -> Result<StakeInfo, ChainError> {
        let oracle = ITellorOracle::new(self.oracle, &self.provider);
        let info = oracle.getStakerInfo(self.address).call().await.map_err(contract_err)?;
        Ok(StakeInfo { staked: info._1, locked: info._2 })
    }

    async fn report_count(&self, query_id: B256) -> Result<U256, ChainError> {
        let oracle = ITellorOracle::new(self.oracle, &self.provider);
        let count = oracle.getNewValueCountbyQueryId(query_id).call().await.map_err(contract_err)?;
        Ok(count._0)
    }

    async fn latest_value(&self, query_id: B256) -> Result<Option<OnChainValue>, ChainError> {
        let oracle = ITellorOracle::new(self.oracle, &self.provider);
        let now = U256::from(Utc::now().timestamp().max(0) as u64 + 1);
        let data = oracle.getDataBefore(query_id, now).call().await.map_err(contract_err)?;
        if !data._ifRetrieve {
            return Ok(None);
        }
        let secs: u64 = data._timestampRetrieved.try_into().unwrap_or(u64::MAX);
        let reported_at = chrono::DateTime::from_timestamp(secs.min(i64::MAX as u64) as i64, 0)
            .ok_or_else(|| ChainError::Rpc(format!("bad report timestamp {secs}")))?;
        Ok(Some(OnChainValue { value: data._value, reported_at }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{hex, Bytes};
    use httpmock::prelude::*;
    use serde_json::json;

    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn chain(server: &MockServer) -> EvmChain<impl Provider + Clone + 'static> {
        let signer: PrivateKeySigner = KEY.parse().unwrap();
        connect(&server.base_url(), signer, Address::repeat_byte(0x42), 31337).unwrap()
    }

    fn report(fees: Fees) -> ReportTx {
        ReportTx {
            query_id: B256::repeat_byte(1),
            value: Bytes::from(U256::from(3000u64).to_be_bytes::<32>().to_vec()),
            report_nonce: U256::from(4),
            query_data: Bytes::from_static(b"query"),
            nonce: 7,
            gas_limit: 350_000,
            fees,
        }
    }

    async fn node_replies(server: &MockServer, reply: serde_json::Value) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("eth_sendRawTransaction");
                then.status(200).json_body(reply);
            })
            .await
    }

    #[tokio::test]
    async fn test_signed_locally_and_broadcast_raw() {
        let server = MockServer::start_async().await;
        let tx = report(Fees::Eip1559 { max_fee: 21_000_000_000, priority_fee: 1_000_000_000 });

        let accepted = json!({"jsonrpc": "2.0", "id": 0, "result": hex::encode_prefixed(B256::repeat_byte(0x11))});
        let m = node_replies(&server, accepted).await;
        let hash = chain(&server).sign_and_send(&tx).await.unwrap();
        m.assert_async().await;
        assert_ne!(hash, B256::ZERO);
        m.delete_async().await;

        // same key, same fields: the rebroadcast carries the same hash
        let known = json!({"jsonrpc": "2.0", "id": 0, "error": {"code": -32000, "message": "already known"}});
        node_replies(&server, known).await;
        assert_eq!(chain(&server).sign_and_send(&tx).await.unwrap(), hash);
    }

    #[tokio::test]
    async fn test_node_rejection_is_classified() {
        let server = MockServer::start_async().await;
        let low = json!({"jsonrpc": "2.0", "id": 0, "error": {"code": -32000, "message": "nonce too low"}});
        node_replies(&server, low).await;
        let err = chain(&server).sign_and_send(&report(Fees::Legacy { gas_price: 11_000_000_000 })).await.unwrap_err();
        assert!(matches!(err, ChainError::NonceTooLow(_)), "{err:?}");
    }
}
