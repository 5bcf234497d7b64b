//! EVM bridge contract ABI definitions.
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the withdrawal
//! contract. Signature verification on-chain recovers each signature under
//! the EIP-191 prefixed sign-hash and requires the recovered address to be a
//! registered signer; replay is prevented by a consumed-set keyed on
//! `keccak256(txHash || txNonce)`.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Bridge withdrawal contract interface.
    #[sol(rpc)]
    contract Bridge {
        // ========================================================================
        // Deposits
        // ========================================================================

        /// Lock (or burn, when wrapped) ERC-20 tokens for bridging.
        function depositERC20(
            address token,
            uint256 amount,
            string calldata receiver,
            bool isWrapped
        ) external;

        /// Lock the native coin for bridging.
        function depositNative(string calldata receiver) external payable;

        // ========================================================================
        // Withdrawals
        // ========================================================================

        /// Release (or mint) ERC-20 tokens against a threshold signature.
        function withdrawERC20(
            address token,
            uint256 amount,
            address receiver,
            bytes32 txHash,
            uint256 txNonce,
            bool isWrapped,
            bytes[] calldata signatures
        ) external;

        /// Release the native coin against a threshold signature.
        function withdrawNative(
            uint256 amount,
            address receiver,
            bytes32 txHash,
            uint256 txNonce,
            bytes[] calldata signatures
        ) external;

        // ========================================================================
        // View functions
        // ========================================================================

        /// The exact digest the contract verifies for an ERC-20 withdrawal
        /// (before EIP-191 prefixing).
        function getERC20SignHash(
            address token,
            uint256 amount,
            address receiver,
            bytes32 txHash,
            uint256 txNonce,
            uint256 chainId,
            bool isWrapped
        ) external view returns (bytes32);

        /// The exact digest the contract verifies for a native withdrawal.
        function getNativeSignHash(
            uint256 amount,
            address receiver,
            bytes32 txHash,
            uint256 txNonce,
            uint256 chainId
        ) external view returns (bytes32);

        /// Whether a (txHash, txNonce) pair has already been consumed.
        function containsTx(bytes32 txHash, uint256 txNonce) external view returns (bool);

        /// Number of signatures required by the contract.
        function threshold() external view returns (uint256);

        // ========================================================================
        // Events
        // ========================================================================

        /// Emitted when ERC-20 tokens are deposited for bridging.
        event DepositedERC20(
            address token,
            uint256 amount,
            string receiver,
            string network,
            bool isWrapped
        );

        /// Emitted when the native coin is deposited for bridging.
        event DepositedNative(uint256 amount, string receiver, string network);

        /// Emitted when a withdrawal is executed.
        event Withdrawn(bytes32 txHash, uint256 txNonce, address receiver);
    }
}
