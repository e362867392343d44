use crate::keeper_error::KeeperError;
use crate::logic::types::ChainId;
use alloy_eips::eip2718::Encodable2718;
use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// A fully priced update transaction, ready to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub chain_id: ChainId,
    pub to: Address,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: U256,
}

/// The JSON-RPC surface the keeper needs from a chain provider.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// `eth_call` against the latest block
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, KeeperError>;

    async fn gas_price(&self) -> Result<U256, KeeperError>;

    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes) -> Result<u64, KeeperError>;

    async fn transaction_count(&self, address: Address) -> Result<u64, KeeperError>;

    /// Signs the request with `signer` and broadcasts it. Returns the transaction hash.
    async fn send_transaction(&self, signer: &PrivateKeySigner, request: SubmissionRequest) -> Result<B256, KeeperError>;
}

/// [`ChainRpc`] over an alloy HTTP provider, every call bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct AlloyChainRpc {
    provider: RootProvider,
    timeout: Duration,
}

impl AlloyChainRpc {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, KeeperError> {
        let url: Url = url
            .parse()
            .map_err(|e| KeeperError::Malformed { what: "provider url", reason: format!("{url}: {e}") })?;
        Ok(Self { provider: RootProvider::new_http(url), timeout })
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = Result<T, KeeperError>>,
    ) -> Result<T, KeeperError> {
        tokio::time::timeout(self.timeout, future)
            .await
            .map_err(|_| KeeperError::Timeout { operation, timeout: self.timeout })?
    }
}

#[async_trait]
impl ChainRpc for AlloyChainRpc {
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, KeeperError> {
        let request = TransactionRequest::default().with_to(to).with_input(data);
        self.bounded("eth_call", async { Ok::<_, KeeperError>(self.provider.call(request).await?) }).await
    }

    async fn gas_price(&self) -> Result<U256, KeeperError> {
        self.bounded("eth_gasPrice", async {
            let gas_price = self.provider.get_gas_price().await?;
            Ok::<_, KeeperError>(U256::from(gas_price))
        })
        .await
    }

    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes) -> Result<u64, KeeperError> {
        let request = TransactionRequest::default().with_from(from).with_to(to).with_input(data);
        self.bounded("eth_estimateGas", async { Ok::<_, KeeperError>(self.provider.estimate_gas(request).await?) }).await
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, KeeperError> {
        self.bounded("eth_getTransactionCount", async {
            Ok::<_, KeeperError>(self.provider.get_transaction_count(address).await?)
        })
        .await
    }

    async fn send_transaction(&self, signer: &PrivateKeySigner, request: SubmissionRequest) -> Result<B256, KeeperError> {
        let gas_price: u128 = request.gas_price.saturating_to();
        let transaction = TransactionRequest::default()
            .with_from(signer.address())
            .with_to(request.to)
            .with_input(request.data)
            .with_chain_id(request.chain_id)
            .with_nonce(request.nonce)
            .with_gas_limit(request.gas_limit)
            .with_gas_price(gas_price);

        let wallet = EthereumWallet::from(signer.clone());
        let envelope = transaction
            .build(&wallet)
            .await
            .map_err(|e| KeeperError::Rpc(format!("failed to sign transaction: {e}")))?;
        let encoded = envelope.encoded_2718();

        self.bounded("eth_sendRawTransaction", async {
            let pending = self
                .provider
                .send_raw_transaction(&encoded)
                .await
                .map_err(|e| KeeperError::from_submission_message(e.to_string()))?;
            let tx_hash = *pending.tx_hash();
            debug!(%tx_hash, nonce = request.nonce, "Transaction broadcast");
            Ok::<_, KeeperError>(tx_hash)
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use alloy_primitives::keccak256;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type CallHandler = Arc<dyn Fn(Address, &Bytes) -> Result<Bytes, KeeperError> + Send + Sync>;

    /// Scriptable in-memory chain used by the execution and scheduler tests.
    #[derive(Clone)]
    pub struct MockChainRpc {
        pub call_handler: CallHandler,
        pub gas_price: Arc<Mutex<Result<U256, String>>>,
        pub estimate: Arc<Mutex<Result<u64, String>>>,
        pub send_error: Arc<Mutex<Option<String>>>,
        pub nonce: Arc<Mutex<u64>>,
        pub sent: Arc<Mutex<Vec<(Address, SubmissionRequest)>>>,
    }

    fn no_call_handler(_to: Address, _data: &Bytes) -> Result<Bytes, KeeperError> {
        Err(KeeperError::Rpc("no call handler".to_string()))
    }

    impl Default for MockChainRpc {
        fn default() -> Self {
            Self {
                call_handler: Arc::new(no_call_handler),
                gas_price: Arc::new(Mutex::new(Ok(U256::from(100u64)))),
                estimate: Arc::new(Mutex::new(Ok(100_000))),
                send_error: Arc::new(Mutex::new(None)),
                nonce: Arc::new(Mutex::new(0)),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl MockChainRpc {
        pub fn with_call_handler(
            handler: impl Fn(Address, &Bytes) -> Result<Bytes, KeeperError> + Send + Sync + 'static,
        ) -> Self {
            Self { call_handler: Arc::new(handler), ..Self::default() }
        }

        pub fn set_gas_price(&self, price: Result<u64, &str>) {
            *self.gas_price.lock() = price.map(U256::from).map_err(str::to_string);
        }

        pub fn set_estimate(&self, estimate: Result<u64, &str>) {
            *self.estimate.lock() = estimate.map_err(str::to_string);
        }

        pub fn set_send_error(&self, error: Option<&str>) {
            *self.send_error.lock() = error.map(str::to_string);
        }

        pub fn sent(&self) -> Vec<(Address, SubmissionRequest)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl ChainRpc for MockChainRpc {
        async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, KeeperError> {
            (self.call_handler)(to, &data)
        }

        async fn gas_price(&self) -> Result<U256, KeeperError> {
            self.gas_price.lock().clone().map_err(KeeperError::Rpc)
        }

        async fn estimate_gas(&self, _from: Address, _to: Address, _data: Bytes) -> Result<u64, KeeperError> {
            self.estimate.lock().clone().map_err(KeeperError::Rpc)
        }

        async fn transaction_count(&self, _address: Address) -> Result<u64, KeeperError> {
            Ok(*self.nonce.lock())
        }

        async fn send_transaction(&self, signer: &PrivateKeySigner, request: SubmissionRequest) -> Result<B256, KeeperError> {
            if let Some(message) = self.send_error.lock().clone() {
                return Err(KeeperError::from_submission_message(message));
            }
            let tx_hash = keccak256([request.data.as_ref(), &request.nonce.to_be_bytes()].concat());
            *self.nonce.lock() += 1;
            self.sent.lock().push((signer.address(), request));
            Ok(tx_hash)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_provider_url() {
        assert!(AlloyChainRpc::new("not a url", Duration::from_secs(1)).is_err());
        assert!(AlloyChainRpc::new("http://127.0.0.1:8545", Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_provider_fails_within_timeout() {
        // Port 9 (discard) is closed on test hosts, the call fails fast or times out
        let rpc = AlloyChainRpc::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let started = std::time::Instant::now();
        assert!(rpc.gas_price().await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
