use alloy_sol_types::sol;

sol! {
    function getLatestStateRootBlockNumber() external view returns (uint256 blockNumber);

    function proveGateway(uint256 blockNumber, bytes rlpAccount, bytes rlpParentNodes) external returns (bool);

    function confirmDeposit(
        address valueToken,
        uint256 amount,
        address beneficiary,
        uint256 feeGasPrice,
        uint256 feeGasLimit,
        address depositor,
        uint256 blockNumber,
        bytes rlpParentNodes
    ) external returns (bytes32 messageHash);

    function confirmWithdraw(
        address utilityToken,
        address valueToken,
        uint256 amount,
        address beneficiary,
        uint256 feeGasPrice,
        uint256 feeGasLimit,
        address withdrawer,
        uint256 blockNumber,
        bytes rlpParentNodes
    ) external returns (bytes32 messageHash);
}
