//! EVM ledger backed by an Axelar-style gateway contract.

use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::network::TransactionBuilder;
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::ChainConfig;
use crate::ledger::client::LedgerClient;
use crate::ledger::rpc::RpcClient;
use crate::ledger::transaction::TxSender;
use crate::ledger::types::{ConfirmationStatus, ExecutePayload, LedgerError, LedgerResult, TxId};
use crate::ledger::wallet::Wallet;

sol! {
    interface IAxelarGateway {
        function sendToken(string destinationChain, string destinationAddress, string symbol, uint256 amount) external;
        function execute(bytes input) external;
        function tokenAddresses(string symbol) external view returns (address);
        function isCommandExecuted(bytes32 commandId) external view returns (bool);
    }

    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

/// Ledger client for one EVM chain.
///
/// Writes are signed by the chain's relayer wallet, so `sender` and `owner`
/// arguments must name that account.
#[derive(Debug)]
pub struct EvmLedger {
    name: String,
    gateway: Option<Address>,
    sender: TxSender,
    relayer: String,
    assets: DashMap<String, Address>,
}

impl EvmLedger {
    /// Connect to a chain using the key from its configured environment variable.
    pub async fn connect(config: ChainConfig) -> LedgerResult<Self> {
        let wallet = Wallet::from_env(&config.private_key_env, config.chain_id)?;
        Self::with_wallet(config, wallet).await
    }

    pub async fn with_wallet(config: ChainConfig, wallet: Wallet) -> LedgerResult<Self> {
        let gateway = config
            .gateway_address
            .as_deref()
            .map(parse_address)
            .transpose()?;
        let name = config.name.clone();
        let client = RpcClient::new(config, wallet.ethereum_wallet())?;

        // Unreachable nodes are tolerated at startup; calls retry later.
        match client.verify_chain_id().await {
            Ok(()) => tracing::info!(chain = %name, rpc_url = %client.config().rpc_url, "Ledger client initialized"),
            Err(e @ LedgerError::ChainMismatch { .. }) => return Err(e),
            Err(e) => tracing::warn!(chain = %name, error = %e, "Ledger client initialized but chain verification failed"),
        }

        let relayer = format!("{:#x}", wallet.address());
        Ok(Self {
            name,
            gateway,
            sender: TxSender::new(client, wallet.address()),
            relayer,
            assets: DashMap::new(),
        })
    }

    fn gateway(&self) -> LedgerResult<Address> {
        self.gateway
            .ok_or_else(|| LedgerError::GatewayUnregistered(self.name.clone()))
    }

    fn require_relayer(&self, account: &str) -> LedgerResult<()> {
        if account.eq_ignore_ascii_case(&self.relayer) {
            Ok(())
        } else {
            Err(LedgerError::Wallet(format!(
                "no signing key for {} on {} (relayer is {})",
                account, self.name, self.relayer
            )))
        }
    }

    async fn view<C: SolCall>(&self, to: Address, call: C) -> LedgerResult<C::Return> {
        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(Bytes::from(call.abi_encode()));
        let raw = self.sender.client().call(tx).await?;
        C::abi_decode_returns(&raw)
            .map_err(|e| LedgerError::Transport(format!("undecodable call result: {}", e)))
    }

    async fn token(&self, symbol: &str) -> LedgerResult<Address> {
        let address = self.resolve_asset(symbol).await?;
        parse_address(&address)
    }
}

#[async_trait]
impl LedgerClient for EvmLedger {
    fn chain(&self) -> &str {
        &self.name
    }

    fn gateway_address(&self) -> Option<String> {
        self.gateway.map(|a| format!("{:#x}", a))
    }

    async fn resolve_asset(&self, symbol: &str) -> LedgerResult<String> {
        if let Some(cached) = self.assets.get(symbol) {
            return Ok(format!("{:#x}", *cached));
        }
        let gateway = self.gateway()?;
        let address = self
            .view(gateway, IAxelarGateway::tokenAddressesCall { symbol: symbol.to_string() })
            .await?;
        if address == Address::ZERO {
            return Err(LedgerError::AssetNotRegistered(symbol.to_string()));
        }
        self.assets.insert(symbol.to_string(), address);
        Ok(format!("{:#x}", address))
    }

    async fn get_balance(&self, account: &str, symbol: &str) -> LedgerResult<u128> {
        let token = self.token(symbol).await?;
        let balance = self
            .view(token, IERC20::balanceOfCall { account: parse_address(account)? })
            .await?;
        to_u128(balance)
    }

    async fn ensure_allowance(
        &self,
        owner: &str,
        spender: &str,
        symbol: &str,
        amount: u128,
    ) -> LedgerResult<Option<TxId>> {
        let token = self.token(symbol).await?;
        let owner_addr = parse_address(owner)?;
        let spender_addr = parse_address(spender)?;

        let available = to_u128(
            self.view(token, IERC20::balanceOfCall { account: owner_addr })
                .await?,
        )?;
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                account: owner.to_string(),
                required: amount,
                available,
            });
        }

        let current = to_u128(
            self.view(token, IERC20::allowanceCall { owner: owner_addr, spender: spender_addr })
                .await?,
        )?;
        if current >= amount {
            tracing::debug!(chain = %self.name, current, amount, "Allowance already sufficient");
            return Ok(None);
        }

        self.require_relayer(owner)?;
        let call = IERC20::approveCall {
            spender: spender_addr,
            amount: U256::from(amount),
        };
        let tx_id = self
            .sender
            .send_and_wait(token, Bytes::from(call.abi_encode()), LedgerError::Reverted)
            .await?;
        Ok(Some(tx_id))
    }

    async fn submit_transfer(
        &self,
        sender: &str,
        dest_chain: &str,
        recipient: &str,
        symbol: &str,
        amount: u128,
    ) -> LedgerResult<TxId> {
        let gateway = self.gateway()?;
        self.require_relayer(sender)?;
        let call = IAxelarGateway::sendTokenCall {
            destinationChain: dest_chain.to_string(),
            destinationAddress: recipient.to_string(),
            symbol: symbol.to_string(),
            amount: U256::from(amount),
        };
        self.sender
            .send_and_wait(gateway, Bytes::from(call.abi_encode()), LedgerError::Reverted)
            .await
    }

    async fn submit_execution(&self, payload: &ExecutePayload) -> LedgerResult<TxId> {
        let gateway = self.gateway()?;
        let call = IAxelarGateway::executeCall {
            input: Bytes::from(payload.to_bytes()?),
        };
        self.sender
            .send_and_wait(gateway, Bytes::from(call.abi_encode()), LedgerError::ExecutionReverted)
            .await
    }

    async fn transaction_status(&self, tx_id: &str) -> LedgerResult<ConfirmationStatus> {
        let hash: TxHash = tx_id
            .parse()
            .map_err(|e| LedgerError::InvalidInput(format!("transaction id '{}': {}", tx_id, e)))?;
        self.sender.status(hash).await
    }

    async fn is_command_executed(&self, command_id: &str) -> LedgerResult<bool> {
        let gateway = self.gateway()?;
        let id: B256 = command_id
            .parse()
            .map_err(|e| LedgerError::InvalidInput(format!("command id '{}': {}", command_id, e)))?;
        self.view(gateway, IAxelarGateway::isCommandExecutedCall { commandId: id })
            .await
    }
}

fn parse_address(raw: &str) -> LedgerResult<Address> {
    raw.trim()
        .parse()
        .map_err(|e| LedgerError::InvalidInput(format!("address '{}': {}", raw, e)))
}

fn to_u128(value: U256) -> LedgerResult<u128> {
    u128::try_from(value)
        .map_err(|_| LedgerError::InvalidInput(format!("amount {} exceeds 128 bits", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_token_encoding() {
        let call = IAxelarGateway::sendTokenCall {
            destinationChain: "Polygon".to_string(),
            destinationAddress: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
            symbol: "USDC".to_string(),
            amount: U256::from(1_000_000_000u128),
        };
        let encoded = call.abi_encode();
        assert_eq!(&encoded[..4], IAxelarGateway::sendTokenCall::SELECTOR.as_slice());
        let decoded = IAxelarGateway::sendTokenCall::abi_decode(&encoded).unwrap();
        assert_eq!(decoded.symbol, "USDC");
        assert_eq!(decoded.amount, U256::from(1_000_000_000u128));
    }

    #[test]
    fn test_to_u128_overflow() {
        assert_eq!(to_u128(U256::from(42u64)).unwrap(), 42);
        assert!(matches!(to_u128(U256::MAX), Err(LedgerError::InvalidInput(_))));
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address("0x5FbDB2315678afecb367f032d93F642f64180aa3").is_ok());
        assert!(matches!(parse_address("nope"), Err(LedgerError::InvalidInput(_))));
    }
}
