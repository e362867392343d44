use alloy_sol_types::sol;

sol! {
    /// Registry listing the feeds that are kept up to date.
    ///
    /// Return values are read through the registry's own `tryMulticall`.
    interface IFeedRegistry {
        function activeDataFeedCount() external view returns (uint256);

        function activeDataFeed(uint256 index)
            external
            view
            returns (
                bytes32 dataFeedId,
                bytes32 dapiName,
                bytes dataFeedDetails,
                int256 dataFeedValue,
                uint256 dataFeedTimestamp,
                int256[] beaconValues,
                uint256[] beaconTimestamps,
                bytes updateParameters,
                string[] signedApiUrls
            );

        function tryMulticall(bytes[] calldata data)
            external
            returns (bool[] memory successes, bytes[] memory returndata);
    }

    /// Feed server accepting signed data.
    interface IFeedServer {
        function updateBeaconWithSignedData(
            address airnode,
            bytes32 templateId,
            uint256 timestamp,
            bytes calldata data,
            bytes calldata signature
        ) external returns (bytes32 beaconId);

        function updateBeaconSetWithBeacons(bytes32[] calldata beaconIds)
            external
            returns (bytes32 beaconSetId);

        function multicall(bytes[] calldata data) external returns (bytes[] memory returndata);

        function tryMulticall(bytes[] calldata data)
            external
            returns (bool[] memory successes, bytes[] memory returndata);
    }
}
