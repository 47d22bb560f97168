pub mod paper;

pub use paper::{PaperChain, PaperChainConfig, PaperSeed, SeedBalance, SeedRate, Submission};
