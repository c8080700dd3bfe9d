//! RSA keypair generation for competition bootstrap.

use std::path::Path;

use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{LineEnding, PrivateKey};
use tracing::debug;

use crate::error::{SshError, SshResult};

const KEY_BITS: usize = 4096;

/// Generate a 4096-bit RSA keypair under `directory` as `id_rsa` (0600)
/// and `id_rsa.pub` (0644). Returns `(public, private)` in OpenSSH form.
pub fn create_ssh_keypair(directory: &Path) -> SshResult<(String, String)> {
    create_keypair_with_bits(directory, KEY_BITS)
}

/// Generate a keypair with an explicit modulus size.
pub fn create_keypair_with_bits(directory: &Path, bits: usize) -> SshResult<(String, String)> {
    std::fs::create_dir_all(directory)?;

    let keypair = RsaKeypair::random(&mut rand::rngs::OsRng, bits)
        .map_err(|e| SshError::Keygen(e.to_string()))?;
    let private = PrivateKey::new(KeypairData::Rsa(keypair), "koth")
        .map_err(|e| SshError::Keygen(e.to_string()))?;

    let private_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| SshError::Keygen(e.to_string()))?;
    let public_line = private
        .public_key()
        .to_openssh()
        .map_err(|e| SshError::Keygen(e.to_string()))?;

    let private_path = directory.join("id_rsa");
    let public_path = directory.join("id_rsa.pub");

    std::fs::write(&private_path, private_pem.as_bytes())?;
    std::fs::write(&public_path, format!("{public_line}\n"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))?;
        std::fs::set_permissions(&public_path, std::fs::Permissions::from_mode(0o644))?;
    }

    debug!(dir = %directory.display(), "ssh keypair written");
    Ok((format!("{public_line}\n"), private_pem.to_string()))
}
