pub mod ed25519;
pub mod secp;

pub use secp::{recover_sender, sign_transaction, verify_transaction};
