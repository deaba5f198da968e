use super::*;

mod public_key_path {
    use super::*;

    #[test]
    fn appends_pub() {
        let credential = Credential::new("/home/me/.ssh/nixploy");
        assert_eq!(
            credential.public_key_path(),
            PathBuf::from("/home/me/.ssh/nixploy.pub"),
        );
    }
}

mod ensure {
    use super::*;

    #[test]
    fn generates_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let credential = Credential::new(dir.path().join("keys/id"));

        assert_eq!(credential.ensure()?, KeyOrigin::Generated);
        let first = credential.public_key()?;
        assert!(first.starts_with("ssh-ed25519 "), "{first}");
        assert!(first.ends_with(" nixploy"), "{first}");

        assert_eq!(credential.ensure()?, KeyOrigin::Existing);
        assert_eq!(credential.public_key()?, first);
        Ok(())
    }

    #[test]
    fn half_pair_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let credential = Credential::new(dir.path().join("id"));
        fs::write(credential.public_key_path(), "ssh-ed25519 AAAA nixploy\n").unwrap();

        let error = credential.ensure().unwrap_err();
        assert!(
            error.to_string().contains("found one half of the login key pair"),
            "unexpected error: {error}",
        );
        assert!(!credential.private_key().exists());
    }
}

mod public_key {
    use super::*;

    fn credential_with(contents: &str) -> (tempfile::TempDir, Credential) {
        let dir = tempfile::tempdir().unwrap();
        let credential = Credential::new(dir.path().join("id"));
        fs::write(credential.public_key_path(), contents).unwrap();
        (dir, credential)
    }

    #[test]
    fn trims_the_line() {
        let (_dir, credential) = credential_with("ssh-ed25519 AAAAC3Nz nixploy\n");
        assert_eq!(credential.public_key().unwrap(), "ssh-ed25519 AAAAC3Nz nixploy");
    }

    #[test]
    fn rejects_garbage() {
        for contents in ["", "not a key\n", "ssh-ed25519 AAAA a\nssh-ed25519 BBBB b\n"] {
            let (_dir, credential) = credential_with(contents);
            assert!(
                matches!(credential.public_key(), Err(Error::InvalidInput(_))),
                "accepted {contents:?}",
            );
        }
    }
}
