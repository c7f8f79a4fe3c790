pub mod custody;
pub mod main_wallet;

pub use custody::KeyVault;
pub use main_wallet::MainWallet;
