//! Fingerprinting a repository's branch state.

use sha2::{Digest, Sha256};

use crate::errors::BackupError;

/// Derive a fingerprint for `repo` from the commit hashes at the head of each
/// of its branches.
///
/// The provider makes no promises about the order branches come back in, so
/// the hashes are sorted before being hashed. The same set of branch heads
/// always produces the same fingerprint, and any change to that set produces
/// a different one.
///
/// Hashes are concatenated without a separator, which relies on git object
/// ids being fixed-length hex strings.
pub fn fingerprint<I, S>(repo: &str, heads: I) -> Result<String, BackupError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut heads: Vec<S> = heads.into_iter().collect();

    if heads.is_empty() {
        return Err(BackupError::EmptyRepository {
            repo: repo.to_string(),
        });
    }

    heads.sort_by(|left, right| left.as_ref().cmp(right.as_ref()));

    let mut hasher = Sha256::new();
    for head in &heads {
        hasher.update(head.as_ref().as_bytes());
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn sha256_hex(input: &str) -> String {
        hex::encode(Sha256::digest(input.as_bytes()))
    }

    #[test]
    fn branch_order_doesnt_matter() {
        let forwards = fingerprint("alice/demo", &["a1", "b2"]).unwrap();
        let backwards = fingerprint("alice/demo", &["b2", "a1"]).unwrap();

        assert_eq!(forwards, backwards);
        assert_eq!(forwards, sha256_hex("a1b2"));
    }

    #[test]
    fn every_permutation_gives_the_same_fingerprint() {
        let heads = [
            "5d6e0c2b8f1e4a7d9c3b2a1f0e9d8c7b6a5f4e3d",
            "0f1e2d3c4b5a69788796a5b4c3d2e1f0a9b8c7d6",
            "c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00",
        ];
        let expected = fingerprint("alice/demo", &heads).unwrap();

        let permutations = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in permutations.iter() {
            let shuffled: Vec<&str> = order.iter().map(|&i| heads[i]).collect();
            assert_eq!(fingerprint("alice/demo", shuffled).unwrap(), expected);
        }
    }

    #[test]
    fn a_new_commit_changes_the_fingerprint() {
        let before = fingerprint("alice/demo", vec!["a1", "b2"]).unwrap();
        let after = fingerprint("alice/demo", vec!["a1", "c3"]).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn repos_without_branches_are_rejected() {
        let heads: Vec<String> = Vec::new();

        let err = fingerprint("alice/empty", heads).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EmptyRepository);
        assert!(err.to_string().contains("alice/empty"));
    }

    #[test]
    fn fingerprints_are_hex_encoded_sha256() {
        let got = fingerprint("alice/demo", &["a1"]).unwrap();

        assert_eq!(got.len(), 64);
        assert!(got.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
