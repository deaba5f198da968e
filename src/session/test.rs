use super::*;

fn result(exit_code: Option<i32>, stderr: &str) -> CommandResult {
    CommandResult::new(exit_code, b"partial output\n".to_vec(), stderr.into(), false)
}

mod command_result {
    use super::*;

    #[test]
    fn check_passes_success_through() {
        let ok = result(Some(0), "");
        assert_eq!(ok.clone().check("true").unwrap(), ok);
    }

    #[test]
    fn check_keeps_output_of_failures() {
        let error = result(Some(3), "boom").check("false").unwrap_err();
        match error {
            Error::RemoteCommand { command, output } => {
                assert_eq!(command, "false");
                assert_eq!(output.exit_code, Some(3));
                assert_eq!(output.stderr, "boom");
            }
            x => panic!("expected Error::RemoteCommand but received:\n{x:?}"),
        }
    }

    #[test]
    fn status_text() {
        assert_eq!(result(Some(1), "").status_text(), "exit code 1");
        assert_eq!(result(None, "").status_text(), "no exit code");
    }
}

mod transport_failure {
    use super::*;

    #[test]
    fn permission_denied_is_authentication() {
        let error = transport_failure(
            "192.0.2.1",
            result(Some(255), "root@192.0.2.1: Permission denied (publickey,password).\n"),
        );
        match &error {
            Error::Authentication { message, .. } => {
                assert!(message.contains("Permission denied"), "{message}")
            }
            e => panic!("unexpected error: {e:?}"),
        }
    }

    #[test]
    fn anything_else_is_connection_with_partial_output() {
        let error = transport_failure(
            "192.0.2.1",
            result(Some(255), "Connection to 192.0.2.1 closed by remote host.\n\n"),
        );
        match error {
            Error::Connection {
                message, partial, ..
            } => {
                assert_eq!(message, "Connection to 192.0.2.1 closed by remote host.");
                assert_eq!(partial.unwrap().stdout, "partial output\n");
            }
            x => panic!("expected Error::Connection but received:\n{x:?}"),
        }
    }
}

mod quote {
    use super::*;

    #[test]
    fn plain_words_are_unchanged() {
        assert_eq!(quote("/etc/nixploy/bare").unwrap(), "/etc/nixploy/bare");
    }

    #[test]
    fn specials_survive_the_shell() {
        for word in ["a b", "it's", "$HOME", "x;rm -rf /"] {
            let quoted = quote(word).unwrap();
            assert_ne!(quoted, word);
            assert_eq!(shlex::split(&quoted).unwrap(), vec![word.to_owned()]);
        }
    }

    #[test]
    fn nul_is_rejected() {
        assert!(quote("a\0b").is_err());
    }
}

mod pump {
    use super::*;

    #[test]
    fn captures_and_echoes() {
        let runtime = runtime().unwrap();
        let mut echoed = Vec::new();
        let captured = runtime
            .block_on(pump(Some(&b"line one\nline two\n"[..]), Some(&mut echoed)))
            .unwrap();
        assert_eq!(captured, b"line one\nline two\n");
        assert_eq!(echoed, captured);
    }

    #[test]
    fn missing_reader_is_empty() {
        let runtime = runtime().unwrap();
        let captured = runtime
            .block_on(pump(None::<&[u8]>, None::<Vec<u8>>))
            .unwrap();
        assert!(captured.is_empty());
    }
}

mod put_bytes {
    use super::*;
    use crate::testing::FakeRemote;

    #[test]
    fn writes_file_with_mode() {
        let remote = FakeRemote::sandboxed();
        let mut session = remote.session("host");
        let path = remote.sandbox().join("hooks/pre-receive");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        session
            .put_bytes(b"#!/bin/sh\nexit 0\n", path.to_str().unwrap(), 0o755)
            .unwrap();

        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
        assert_eq!(std::fs::read(&path).unwrap(), b"#!/bin/sh\nexit 0\n");
    }

    #[test]
    fn failure_is_transfer_error() {
        let remote = FakeRemote::sandboxed();
        let mut session = remote.session("host");
        let path = remote.sandbox().join("missing-dir/file");

        match session.put_bytes(b"x", path.to_str().unwrap(), 0o644) {
            Err(Error::Transfer { remote_path, .. }) => {
                assert_eq!(remote_path, path.to_str().unwrap())
            }
            x => panic!("expected Error::Transfer but received:\n{x:?}"),
        }
    }
}

mod put_file {
    use super::*;
    use crate::testing::FakeRemote;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn copies_contents_and_sets_mode() {
        let local = tempfile::tempdir().unwrap();
        let source = local.path().join("configuration.nix");
        std::fs::write(&source, "{ ... }:\n{ }\n").unwrap();

        let remote = FakeRemote::sandboxed();
        let mut session = remote.session("host");
        let target = remote.sandbox().join("configuration.nix");
        session
            .put_file(&source, target.to_str().unwrap(), 0o640)
            .unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "{ ... }:\n{ }\n");
        let metadata = std::fs::metadata(&target).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn missing_local_file_fails_before_running_anything() {
        let local = tempfile::tempdir().unwrap();
        let remote = FakeRemote::sandboxed();
        let mut session = remote.session("host");

        let result = session.put_file(&local.path().join("absent"), "/tmp/absent", 0o644);
        assert!(matches!(result, Err(Error::Local(_))), "{result:?}");
        assert!(remote.commands().is_empty());
    }
}
