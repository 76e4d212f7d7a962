use alloy::sol;

sol! {
    /// Bribe market contract: market registry, outcome deposits, sponsor bribe pools
    /// and per-position reward accounting.
    #[sol(rpc)]
    interface IBribeMarket {
        struct BribePool {
            uint256 id;
            address sponsor;
            address token;
            uint256 totalAmount;
            uint64 startTime;
            uint64 endTime;
            bytes32 conditionId;
            uint8 outcome;
        }

        event MarketCreated(
            bytes32 indexed conditionId,
            address indexed oracle,
            bytes32 indexed questionId,
            uint256 outcomeSlotCount,
            uint64 startTime,
            uint64 endTime
        );

        event Deposited(
            bytes32 indexed conditionId,
            uint8 indexed outcome,
            address indexed account,
            uint256 amount
        );

        function pendingRewards(bytes32 conditionId, uint8 outcome) external view returns (uint256);

        function harvest(bytes32 conditionId, uint8 outcome) external;

        function getBribePoolIds(bytes32 conditionId, uint8 outcome) external view returns (uint256[] memory);

        function getBribePool(uint256 poolId) external view returns (BribePool memory);
    }
}
