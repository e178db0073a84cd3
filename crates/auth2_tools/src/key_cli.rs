#![forbid(unsafe_code)]

use auth2_engines::key_envelope::EncryptedKeyEnvelope;

/// `auth2 key <subcommand>`. Output never contains key material.
pub fn execute_key_command(
    envelope: &EncryptedKeyEnvelope,
    subcommand: &str,
) -> Result<String, String> {
    match subcommand {
        "status" => {
            envelope
                .initialize()
                .map_err(|e| format!("failed to open keystore: {e}"))?;
            let status = envelope
                .status()
                .map_err(|e| format!("failed to read key status: {e}"))?;
            Ok(status.as_str().to_string())
        }
        _ => Err(format!(
            "unknown key subcommand: {subcommand}. expected one of: status"
        )),
    }
}
