use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Expected digests, hex encoded. Only the strongest one supplied is checked,
/// in the order sha1, sha256, md5.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub md5: Option<String>,
}

impl Checksums {
    pub fn is_empty(&self) -> bool {
        self.sha1.is_none() && self.sha256.is_none() && self.md5.is_none()
    }

    pub(crate) fn verifier(&self) -> Option<Verifier> {
        let pick = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_ascii_lowercase)
        };
        if let Some(expected) = pick(&self.sha1) {
            return Some(Verifier::Sha1(sha1::Sha1::new(), expected));
        }
        if let Some(expected) = pick(&self.sha256) {
            return Some(Verifier::Sha256(Sha256::new(), expected));
        }
        pick(&self.md5).map(|expected| Verifier::Md5(md5::Md5::new(), expected))
    }
}

/// Incremental digest of a download against one expected value.
pub(crate) enum Verifier {
    Sha1(sha1::Sha1, String),
    Sha256(Sha256, String),
    Md5(md5::Md5, String),
}

impl Verifier {
    pub(crate) fn algorithm(&self) -> &'static str {
        match self {
            Verifier::Sha1(..) => "sha1",
            Verifier::Sha256(..) => "sha256",
            Verifier::Md5(..) => "md5",
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            Verifier::Sha1(h, _) => h.update(data),
            Verifier::Sha256(h, _) => h.update(data),
            Verifier::Md5(h, _) => h.update(data),
        }
    }

    /// Returns the actual digest when it does not match.
    pub(crate) fn finish(self) -> Result<(), String> {
        let (actual, expected) = match self {
            Verifier::Sha1(h, e) => (hex::encode(h.finalize()), e),
            Verifier::Sha256(h, e) => (hex::encode(h.finalize()), e),
            Verifier::Md5(h, e) => (hex::encode(h.finalize()), e),
        };
        if actual == expected { Ok(()) } else { Err(actual) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_wins_over_the_others() {
        let sums = Checksums {
            sha1: Some("AA".into()),
            sha256: Some("bb".into()),
            md5: Some("cc".into()),
        };
        assert_eq!(sums.verifier().unwrap().algorithm(), "sha1");

        let sums = Checksums {
            sha256: Some("bb".into()),
            md5: Some("cc".into()),
            ..Checksums::default()
        };
        assert_eq!(sums.verifier().unwrap().algorithm(), "sha256");
        assert!(Checksums::default().verifier().is_none());
    }

    #[test]
    fn comparison_ignores_case() {
        // sha256("abc")
        let sums = Checksums {
            sha256: Some(
                "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".into(),
            ),
            ..Checksums::default()
        };
        let mut verifier = sums.verifier().unwrap();
        verifier.update(b"ab");
        verifier.update(b"c");
        assert!(verifier.finish().is_ok());
    }

    #[test]
    fn mismatch_reports_actual_digest() {
        let sums = Checksums {
            md5: Some("00000000000000000000000000000000".into()),
            ..Checksums::default()
        };
        let mut verifier = sums.verifier().unwrap();
        verifier.update(b"abc");
        assert_eq!(
            verifier.finish().unwrap_err(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }
}
