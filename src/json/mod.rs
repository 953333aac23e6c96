//! JSON tokenization and the descriptor-aware event adapter (C3).

pub mod events;
pub mod lexer;

pub use events::drive;
pub use lexer::{JsonLexer, Token};
