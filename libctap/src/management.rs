mod credential_management;
pub use credential_management::CredentialManagement;
