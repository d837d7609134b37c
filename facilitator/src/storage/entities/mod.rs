pub mod deposit_intents;
pub mod erc20_gateway_token_pairs;
pub mod gateways;
pub mod messages;
pub mod withdraw_intents;
