//! Configured server endpoints: the `(security policy, security mode)`
//! pairs the server is willing to open channels with.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use uasc_crypto::SecurityPolicy;
use uasc_types::MessageSecurityMode;

/// A configured server endpoint.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ServerEndpoint {
    /// Endpoint path.
    pub path: String,
    /// Security policy.
    pub security_policy: String,
    /// Security mode.
    pub security_mode: String,
    /// Security level, higher being more secure.
    pub security_level: u8,
}

/// Convenience method to make an endpoint from a tuple
impl<'a> From<(&'a str, SecurityPolicy, MessageSecurityMode)> for ServerEndpoint {
    fn from(v: (&'a str, SecurityPolicy, MessageSecurityMode)) -> ServerEndpoint {
        ServerEndpoint::new(v.0, v.1, v.2)
    }
}

impl ServerEndpoint {
    /// Create a new server endpoint.
    pub fn new<T>(
        path: T,
        security_policy: SecurityPolicy,
        security_mode: MessageSecurityMode,
    ) -> Self
    where
        T: Into<String>,
    {
        ServerEndpoint {
            path: path.into(),
            security_policy: security_policy.to_string(),
            security_mode: security_mode.to_string(),
            security_level: Self::security_level(security_policy, security_mode),
        }
    }

    /// Recommends a security level for the supplied security policy
    fn security_level(security_policy: SecurityPolicy, security_mode: MessageSecurityMode) -> u8 {
        let security_level = match security_policy {
            SecurityPolicy::Basic128Rsa15 => 1,
            SecurityPolicy::Basic256 => 3,
            _ => 0,
        };
        if security_mode == MessageSecurityMode::SignAndEncrypt {
            security_level + 10
        } else {
            security_level
        }
    }

    /// Create a new unsecured server endpoint.
    pub fn new_none<T>(path: T) -> Self
    where
        T: Into<String>,
    {
        Self::new(path, SecurityPolicy::None, MessageSecurityMode::None)
    }

    /// Create a new server endpoint with Basic128Rsa15 signing.
    ///
    /// # Warning
    ///
    /// This security policy is deprecated in the OPC-UA standard for being
    /// insecure.
    pub fn new_basic128rsa15_sign<T>(path: T) -> Self
    where
        T: Into<String>,
    {
        Self::new(path, SecurityPolicy::Basic128Rsa15, MessageSecurityMode::Sign)
    }

    /// Create a new server endpoint with Basic128Rsa15 encryption.
    ///
    /// # Warning
    ///
    /// This security policy is deprecated in the OPC-UA standard for being
    /// insecure.
    pub fn new_basic128rsa15_sign_encrypt<T>(path: T) -> Self
    where
        T: Into<String>,
    {
        Self::new(
            path,
            SecurityPolicy::Basic128Rsa15,
            MessageSecurityMode::SignAndEncrypt,
        )
    }

    /// Create a new server endpoint with Basic256 signing.
    ///
    /// # Warning
    ///
    /// This security policy is deprecated in the OPC-UA standard for being
    /// insecure.
    pub fn new_basic256_sign<T>(path: T) -> Self
    where
        T: Into<String>,
    {
        Self::new(path, SecurityPolicy::Basic256, MessageSecurityMode::Sign)
    }

    /// Create a new server endpoint with Basic256 encryption.
    ///
    /// # Warning
    ///
    /// This security policy is deprecated in the OPC-UA standard for being
    /// insecure.
    pub fn new_basic256_sign_encrypt<T>(path: T) -> Self
    where
        T: Into<String>,
    {
        Self::new(
            path,
            SecurityPolicy::Basic256,
            MessageSecurityMode::SignAndEncrypt,
        )
    }

    /// Validate the endpoint and return a list of validation errors.
    pub fn validate(&self, id: &str) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let security_policy = self.security_policy();
        let security_mode = self.message_security_mode();
        if security_policy == SecurityPolicy::Unknown {
            errors.push(format!(
                "Endpoint {} is invalid. Security policy \"{}\" is invalid. Valid values are None, Basic128Rsa15, Basic256",
                id, self.security_policy
            ));
        } else if security_mode == MessageSecurityMode::Invalid {
            errors.push(format!(
                "Endpoint {} is invalid. Security mode \"{}\" is invalid. Valid values are None, Sign, SignAndEncrypt",
                id, self.security_mode
            ));
        } else if (security_policy == SecurityPolicy::None)
            != (security_mode == MessageSecurityMode::None)
        {
            errors.push(format!(
                "Endpoint {} is invalid. Security policy and security mode must both contain None or neither of them should.",
                id
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get the security policy of this endpoint.
    pub fn security_policy(&self) -> SecurityPolicy {
        SecurityPolicy::from_str(&self.security_policy).unwrap_or(SecurityPolicy::Unknown)
    }

    /// Get the message security mode of this endpoint.
    pub fn message_security_mode(&self) -> MessageSecurityMode {
        MessageSecurityMode::from(self.security_mode.as_ref())
    }

    /// `true` if this endpoint supports the supplied policy and mode pair.
    pub fn supports(
        &self,
        security_policy: SecurityPolicy,
        security_mode: MessageSecurityMode,
    ) -> bool {
        self.security_policy() == security_policy && self.message_security_mode() == security_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_matching_pair() {
        let endpoint = ServerEndpoint::new_basic256_sign_encrypt("/");
        assert!(endpoint.supports(
            SecurityPolicy::Basic256,
            MessageSecurityMode::SignAndEncrypt
        ));
        assert!(!endpoint.supports(SecurityPolicy::Basic256, MessageSecurityMode::Sign));
        assert!(!endpoint.supports(SecurityPolicy::None, MessageSecurityMode::None));
    }

    #[test]
    fn security_levels() {
        assert_eq!(ServerEndpoint::new_none("/").security_level, 0);
        assert_eq!(ServerEndpoint::new_basic128rsa15_sign("/").security_level, 1);
        assert_eq!(
            ServerEndpoint::new_basic256_sign_encrypt("/").security_level,
            13
        );
    }

    #[test]
    fn mismatched_none_fails_validation() {
        let endpoint = ServerEndpoint {
            path: "/".to_string(),
            security_policy: "None".to_string(),
            security_mode: "Sign".to_string(),
            security_level: 0,
        };
        assert!(endpoint.validate("test").is_err());
        assert!(ServerEndpoint::new_none("/").validate("test").is_ok());
    }
}
