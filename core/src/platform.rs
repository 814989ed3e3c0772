//! Platform detection for the TLS 1.2 workaround.
//!
//! Android exposes TLS 1.1 and 1.2 from API level 16 but only enables them on
//! new sockets from level 20; several vendor builds below level 22 still ship
//! sockets with only TLS 1.0 enabled. Those levels get their sockets pinned
//! to TLS 1.2. Everything else, including non-Android hosts, is left alone.

use std::ops::Range;

use crate::tls::TlsVersion;

/// API levels whose sockets must be forced onto TLS 1.2.
pub const TLS12_PATCH_LEVELS: Range<u32> = 16..22;

/// The running platform, as far as TLS behavior is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Platform {
    api_level: Option<u32>,
}

impl Platform {
    /// A desktop or server host with a modern TLS stack.
    pub const fn host() -> Self {
        Self { api_level: None }
    }

    pub const fn android(api_level: u32) -> Self {
        Self {
            api_level: Some(api_level),
        }
    }

    /// Detect the running platform. On Android this reads the
    /// `ro.build.version.sdk` system property; elsewhere it is `host()`.
    pub fn detect() -> Self {
        #[cfg(target_os = "android")]
        {
            if let Some(level) = android_api_level() {
                return Self::android(level);
            }
        }
        Self::host()
    }

    pub fn api_level(&self) -> Option<u32> {
        self.api_level
    }

    /// Whether sockets on this platform must be forced onto TLS 1.2.
    pub fn needs_tls12_patch(&self) -> bool {
        self.api_level
            .is_some_and(|level| TLS12_PATCH_LEVELS.contains(&level))
    }

    /// Protocol versions the platform's TLS stack can enable.
    pub fn supported_tls_versions(&self) -> Vec<TlsVersion> {
        match self.api_level {
            None => vec![TlsVersion::Tls12, TlsVersion::Tls13],
            Some(level) => {
                let mut versions = vec![TlsVersion::Tls10];
                if level >= 16 {
                    versions.extend([TlsVersion::Tls11, TlsVersion::Tls12]);
                }
                if level >= 29 {
                    versions.push(TlsVersion::Tls13);
                }
                versions
            }
        }
    }

    /// Protocol versions enabled on a freshly created socket.
    pub fn default_tls_versions(&self) -> Vec<TlsVersion> {
        match self.api_level {
            None => vec![TlsVersion::Tls12, TlsVersion::Tls13],
            Some(level) => {
                let mut versions = vec![TlsVersion::Tls10];
                if level >= 20 {
                    versions.extend([TlsVersion::Tls11, TlsVersion::Tls12]);
                }
                if level >= 29 {
                    versions.push(TlsVersion::Tls13);
                }
                versions
            }
        }
    }
}

#[cfg(target_os = "android")]
fn android_api_level() -> Option<u32> {
    let output = std::process::Command::new("getprop")
        .arg("ro.build.version.sdk")
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}
