mod passwords;

pub use passwords::{KeyringPasswords, PasswordPrompt, StorageError};
