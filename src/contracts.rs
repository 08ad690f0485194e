//! Centralized contract definitions.
//!
//! All Solidity interfaces the keeper talks to, defined with alloy's `sol!`
//! macro and annotated `#[sol(rpc)]` so instance types can make RPC calls
//! through any alloy Provider.
//!
//! Payload shapes follow the current router ABI; superseded variants of the
//! unlock/resolve calls are not carried here.

use alloy::sol;

// ── Settlement router ────────────────────────────────────────────────

sol! {
    #[sol(rpc)]
    interface ISettlementRouter {
        /// Opaque signature plus the timestamp/expiry it was produced for.
        struct SignInfo {
            bytes signature;
            uint256 timestamp;
        }

        /// One open/resolve settlement call.
        struct TradeEntry {
            uint256 queueId;
            address user;
            uint256 tradeSize;
            uint256 period;
            address targetContract;
            uint256 strike;
            uint256 slippage;
            bool allowPartialFill;
            string referralCode;
            uint256 traderNFTId;
            uint256 price;
            uint256 settlementFee;
            bool isLimitOrder;
            uint256 limitOrderExpiry;
            SignInfo settlementFeeSignInfo;
            SignInfo userSignInfo;
            SignInfo publisherSignInfo;
        }

        /// One unlock/expire settlement call.
        struct ExecuteEntry {
            uint256 optionId;
            address targetContract;
            uint256 price;
            bool isAbove;
            SignInfo userSignInfo;
            SignInfo publisherSignInfo;
        }

        function openTrades(TradeEntry[] calldata params) external;
        function resolveQueuedTrades(TradeEntry[] calldata params) external;
        function executeOptions(ExecuteEntry[] calldata params) external;

        /// Queue slot state: a non-zero taker means the entry was consumed.
        function queuedTrades(uint256 queueId) external view returns (address taker, uint256 queuedTimestamp);
        function optionIdMapping(address targetContract, uint256 optionId) external view returns (uint256 queueId);

        event FailResolve(uint256 indexed queueId, string reason);
        event FailUnlock(uint256 indexed optionId, address targetContract, string reason);
    }
}

// ── Options market ───────────────────────────────────────────────────

sol! {
    #[sol(rpc)]
    interface IOptionsMarket {
        /// state: 0 = inactive, 1 = active, 2 = exercised, 3 = expired.
        function options(uint256 optionId) external view returns (uint8 state, uint256 strike, uint256 amount, uint256 expirationTime);
        function assetPair() external view returns (string memory);
    }
}

// ── Multicall3 (batched reads, single block height) ──────────────────

sol! {
    #[sol(rpc)]
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (Result[] memory returnData);
    }
}
