pub mod cipher;

pub use cipher::MessageCipher;
