//! End-to-end transaction and repair scenarios over on-disk fixtures.

use anyhow::Result;
use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;

use appdepot_lib::config;
use appdepot_lib::fixture::{Fixture, RecordingFrontend};
use appdepot_lib::frontend::{Answer, Readiness};
use appdepot_lib::installation::Installation;
use appdepot_lib::refname::{PartialRef, Ref};
use appdepot_lib::remote::{RelatedRef, RemoteConfig, SparseRefInfo, Summary};
use appdepot_lib::repair::{repair, RepairOptions};
use appdepot_lib::store::{ObjectId, ObjectKind, ObjectStatus, ObjectStore};
use appdepot_lib::transaction::{Transaction, TransactionFlags};
use appdepot_lib::Error;

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

fn setup() -> (Fixture, Installation, ObjectStore) {
    let fx = Fixture::new().unwrap();
    let inst = fx.installation().unwrap();
    let repo = fx.remote_repo().unwrap();
    fx.add_file_remote(&inst, "origin").unwrap();
    (fx, inst, repo)
}

fn publish(
    fx: &Fixture,
    repo: &ObjectStore,
    summary: &mut Summary,
    refstr: &str,
    files: &[(&str, &[u8])],
) -> ObjectId {
    let commit = fx.commit_sample_tree(repo, files);
    summary
        .refs
        .insert(refstr.to_string(), Fixture::summary_ref(&commit));
    commit
}

fn object_path(store: &ObjectStore, kind: ObjectKind, id: &ObjectId) -> Utf8PathBuf {
    let (pfx, rest) = id.fanout();
    store
        .path()
        .join(format!("objects/{pfx}/{rest}.{}", kind.ext()))
}

fn fsck_whole_commit(store: &ObjectStore, commit: &ObjectId) -> Result<bool> {
    let mut ok = true;
    store.walk(commit, &mut |kind, id| {
        if store.fsck_object(kind, id)? != ObjectStatus::Ok {
            ok = false;
        }
        Ok(true)
    })?;
    Ok(ok)
}

/// Install of a new app whose runtime is missing: the resolver emits
/// the runtime install first, both deploy, and prune is a no-op.
#[test]
fn test_install_app_with_missing_runtime() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let rt_ref = format!("runtime/org.acme.Platform/{arch}/24.08");
    let app_ref = format!("app/org.acme.Draw/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &rt_ref, &[("usr/lib/libplatform.so", b"so")]);
    let app_commit = publish(&fx, &repo, &mut summary, &app_ref, &[("bin/draw", b"elf")]);
    summary.refs.get_mut(&app_ref).unwrap().runtime_ref = Some(rt_ref.clone());
    fx.write_summary(&repo, &summary).unwrap();

    let fe = RecordingFrontend::default();
    let mut txn = Transaction::new(&inst, TransactionFlags::default(), Box::new(fe.clone()));
    txn.add_install(
        Some("origin".into()),
        PartialRef::parse("org.acme.Draw").unwrap(),
        vec![],
    );
    let summary_r = txn.run(&cancel()).unwrap();
    assert_eq!(summary_r.executed, 2);
    assert_eq!(summary_r.failed, 0);

    // Runtime before app in the emitted order
    let lines = fe.lines();
    assert_eq!(
        lines[0],
        format!("ready [install:{rt_ref}, install:{app_ref}]")
    );

    assert!(inst.is_installed(&Ref::parse(&app_ref).unwrap()).unwrap());
    assert!(inst.is_installed(&Ref::parse(&rt_ref).unwrap()).unwrap());
    let store = inst.ensure_repo().unwrap();
    assert_eq!(
        store.resolve_ref(Some("origin"), &app_ref).unwrap(),
        Some(app_commit)
    );
    // Everything is reachable; prune removes nothing
    assert_eq!(store.prune(0).unwrap().pruned, 0);
}

/// Reinstall over a corrupted object: the plan is uninstall-then-
/// install, and the damaged object is refetched.
#[test]
fn test_reinstall_over_corruption() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Foo/{arch}/stable");
    let mut summary = Summary::default();
    let commit = publish(&fx, &repo, &mut summary, &app_ref, &[("bin/foo", b"payload")]);
    fx.write_summary(&repo, &summary).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Foo").unwrap(), vec![]);
    txn.run(&cancel()).unwrap();

    // Truncate the file object in the local store
    let store = inst.ensure_repo().unwrap();
    let file_obj = ObjectId::digest(b"payload").unwrap();
    std::fs::write(object_path(&store, ObjectKind::File, &file_obj).as_std_path(), b"x").unwrap();
    assert_eq!(
        store.fsck_object(ObjectKind::File, &file_obj).unwrap(),
        ObjectStatus::Invalid
    );

    let fe = RecordingFrontend::default();
    let flags = TransactionFlags {
        reinstall: true,
        ..Default::default()
    };
    let mut txn = Transaction::new(&inst, flags, Box::new(fe.clone()));
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Foo").unwrap(), vec![]);
    let r = txn.run(&cancel()).unwrap();
    assert_eq!(r.executed, 2);
    assert_eq!(
        fe.lines()[0],
        format!("ready [uninstall:{app_ref}, install:{app_ref}]")
    );

    assert!(fsck_whole_commit(&store, &commit).unwrap());
    // The staging area is gone with the transaction
    assert_eq!(
        inst.get_removed_dir().unwrap().entries().unwrap().count(),
        0
    );
}

/// Applying the same reinstall twice converges to the same state.
#[test]
fn test_reinstall_idempotent() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Foo/{arch}/stable");
    let mut summary = Summary::default();
    let commit = publish(&fx, &repo, &mut summary, &app_ref, &[("bin/foo", b"v1")]);
    fx.write_summary(&repo, &summary).unwrap();

    for _ in 0..2 {
        let flags = TransactionFlags {
            reinstall: true,
            ..Default::default()
        };
        let mut txn = Transaction::new(&inst, flags, Box::new(RecordingFrontend::default()));
        txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Foo").unwrap(), vec![]);
        txn.run(&cancel()).unwrap();
    }
    let r = Ref::parse(&app_ref).unwrap();
    assert_eq!(inst.load_deploy_data(&r).unwrap().commit, commit);
    assert_eq!(inst.deployments_for(&r).unwrap().len(), 1);
}

/// Uninstalling a runtime another app uses prompts; "no" skips the op,
/// "yes" removes the runtime and leaves the app dangling.
#[test]
fn test_uninstall_runtime_in_use() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let rt_ref = format!("runtime/org.acme.Platform/{arch}/24.08");
    let app_ref = format!("app/org.acme.Draw/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &rt_ref, &[("usr/lib/p.so", b"so")]);
    publish(&fx, &repo, &mut summary, &app_ref, &[("bin/draw", b"elf")]);
    summary.refs.get_mut(&app_ref).unwrap().runtime_ref = Some(rt_ref.clone());
    fx.write_summary(&repo, &summary).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Draw").unwrap(), vec![]);
    txn.run(&cancel()).unwrap();

    let rt = Ref::parse(&rt_ref).unwrap();

    // Declined: the op is skipped, the run succeeds with zero changes
    let fe = RecordingFrontend::default();
    fe.set_confirm_answer(Answer::No);
    let mut txn = Transaction::new(&inst, TransactionFlags::default(), Box::new(fe.clone()));
    txn.add_uninstall(PartialRef::parse(&rt_ref).unwrap());
    let r = txn.run(&cancel()).unwrap();
    assert_eq!((r.executed, r.skipped), (0, 1));
    assert!(fe
        .lines()
        .iter()
        .any(|l| l.starts_with("confirm Applications using this runtime: org.acme.Draw")));
    assert!(inst.is_installed(&rt).unwrap());

    // Confirmed: the runtime goes away, the app stays (dangling)
    let fe = RecordingFrontend::default();
    let mut txn = Transaction::new(&inst, TransactionFlags::default(), Box::new(fe.clone()));
    txn.add_uninstall(PartialRef::parse(&rt_ref).unwrap());
    let r = txn.run(&cancel()).unwrap();
    assert_eq!(r.executed, 1);
    assert!(!inst.is_installed(&rt).unwrap());
    assert!(inst
        .is_installed(&Ref::parse(&app_ref).unwrap())
        .unwrap());
}

/// Install-then-uninstall returns the installation to its prior state;
/// the end-of-transaction prune clears the object residue.
#[test]
fn test_install_uninstall_roundtrip() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Tiny/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &app_ref, &[("bin/tiny", b"t")]);
    fx.write_summary(&repo, &summary).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Tiny").unwrap(), vec![]);
    txn.run(&cancel()).unwrap();
    assert_eq!(inst.list_installed_refs().unwrap().len(), 1);

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_uninstall(PartialRef::parse(&app_ref).unwrap());
    txn.run(&cancel()).unwrap();

    assert!(inst.list_installed_refs().unwrap().is_empty());
    let store = inst.ensure_repo().unwrap();
    assert!(store.list_refs(None).unwrap().is_empty());
    // The uninstall dropped the refs, so the final prune emptied the store
    assert!(store.list_objects().unwrap().is_empty());
}

/// Repair of a subpath-limited deployment with an in-subpath corrupt
/// object: the object is deleted, the ref classified damaged and
/// dropped, and the deployment re-materialized through the engine.
#[test]
fn test_repair_partial_commit() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Bar/{arch}/stable");
    let mut summary = Summary::default();
    publish(
        &fx,
        &repo,
        &mut summary,
        &app_ref,
        &[("share/doc", b"manual"), ("bin/bar", b"elf")],
    );
    fx.write_summary(&repo, &summary).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install(
        Some("origin".into()),
        PartialRef::parse("org.acme.Bar").unwrap(),
        vec!["/share".into()],
    );
    txn.run(&cancel()).unwrap();

    let r = Ref::parse(&app_ref).unwrap();
    let store = inst.ensure_repo().unwrap();
    let data = inst.load_deploy_data(&r).unwrap();
    assert_eq!(data.subpaths, vec!["/share".to_string()]);
    assert!(store.commit_is_partial(&data.commit).unwrap());

    // Corrupt the in-subpath file object
    let doc_obj = ObjectId::digest(b"manual").unwrap();
    std::fs::write(object_path(&store, ObjectKind::File, &doc_obj).as_std_path(), b"!").unwrap();

    let fe = RecordingFrontend::default();
    let result = repair(&inst, &fe, &RepairOptions::default(), &cancel()).unwrap();
    assert!(!result.dry_run);
    assert_eq!(result.invalid_objects, 1);
    assert_eq!(result.refs_deleted, vec![format!("origin:{app_ref}")]);
    assert_eq!(result.reinstalled, vec![app_ref.clone()]);

    // Re-materialized: installed again, same subpaths, healthy object
    let data = inst.load_deploy_data(&r).unwrap();
    assert_eq!(data.subpaths, vec!["/share".to_string()]);
    assert_eq!(
        store.fsck_object(ObjectKind::File, &doc_obj).unwrap(),
        ObjectStatus::Ok
    );

    // A second repair right after is a no-op
    let result = repair(&inst, &fe, &RepairOptions::default(), &cancel()).unwrap();
    assert_eq!(result.invalid_objects, 0);
    assert!(result.refs_deleted.is_empty());
    assert!(result.reinstalled.is_empty());
}

/// Dry-run repair reads everything and mutates nothing.
#[test]
fn test_repair_dry_run_is_read_only() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Baz/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &app_ref, &[("bin/baz", b"bits")]);
    fx.write_summary(&repo, &summary).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Baz").unwrap(), vec![]);
    txn.run(&cancel()).unwrap();

    let store = inst.ensure_repo().unwrap();
    let obj = ObjectId::digest(b"bits").unwrap();
    std::fs::write(object_path(&store, ObjectKind::File, &obj).as_std_path(), b"??").unwrap();

    let fe = RecordingFrontend::default();
    let opts = RepairOptions {
        dry_run: true,
        ..Default::default()
    };
    let result = repair(&inst, &fe, &opts, &cancel()).unwrap();
    assert!(result.dry_run);
    assert_eq!(result.refs_deleted, vec![format!("origin:{app_ref}")]);
    // Nothing actually changed
    assert_eq!(
        store.fsck_object(ObjectKind::File, &obj).unwrap(),
        ObjectStatus::Invalid
    );
    assert_eq!(
        store.resolve_ref(Some("origin"), &app_ref).unwrap().is_some(),
        true
    );
}

/// `--unused` with the only candidate pinned yields an empty plan.
#[test]
fn test_unused_respects_pins() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let rt_ref = format!("runtime/org.acme.Quiet/{arch}/1");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &rt_ref, &[("usr/lib/q.so", b"q")]);
    fx.write_summary(&repo, &summary).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Quiet").unwrap(), vec![]);
    txn.run(&cancel()).unwrap();

    let rt = Ref::parse(&rt_ref).unwrap();
    assert_eq!(inst.list_unused_refs().unwrap(), vec![rt.clone()]);
    inst.set_pinned(&rt, true).unwrap();
    assert!(inst.list_unused_refs().unwrap().is_empty());
    assert!(inst.is_installed(&rt).unwrap());
}

/// Preinstall sync with the network unavailable: the sideload serves
/// the summary and the objects, quietly.
#[test]
fn test_preinstall_from_sideload() {
    let fx = Fixture::new().unwrap();
    let inst = fx.installation().unwrap();
    // The remote exists but publishes nothing (network gone)
    let _empty_remote = fx.remote_repo().unwrap();
    inst.add_remote(&RemoteConfig {
        name: "origin".into(),
        url: format!("file://{}", fx.path.join("remote")),
        collection_id: Some("org.acme.Apps".into()),
        ..Default::default()
    })
    .unwrap();

    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Base/{arch}/stable");
    let sideload = fx.sideload_repo().unwrap();
    let commit = fx.commit_sample_tree(&sideload, &[("bin/base", b"base")]);
    let mut summary = Summary {
        collection_id: Some("org.acme.Apps".into()),
        ..Default::default()
    };
    summary
        .refs
        .insert(app_ref.clone(), Fixture::summary_ref(&commit));
    fx.write_summary(&sideload, &summary).unwrap();

    let list_dir = fx.path.join("preinstall.d");
    std::fs::create_dir_all(list_dir.as_std_path()).unwrap();
    std::fs::write(
        list_dir.join("base.preinstall").as_std_path(),
        "[Preinstall]\nRef=app/org.acme.Base\nBranch=stable\n",
    )
    .unwrap();

    let summary_r = appdepot_lib::preinstall::sync(
        &inst,
        &list_dir,
        vec![fx.path.join("sideload")],
        false,
        false,
        &cancel(),
    )
    .unwrap();
    assert_eq!(summary_r.executed, 1);
    assert!(inst.is_installed(&Ref::parse(&app_ref).unwrap()).unwrap());
    // Sideload use under a collection leaves a mirror ref behind
    let store = inst.ensure_repo().unwrap();
    assert_eq!(store.list_mirror_refs().unwrap().len(), 1);

    // A second sync has nothing to do
    let summary_r = appdepot_lib::preinstall::sync(
        &inst,
        &list_dir,
        vec![fx.path.join("sideload")],
        false,
        false,
        &cancel(),
    )
    .unwrap();
    assert_eq!(summary_r.executed, 0);
}

/// EOL_REBASE rewrites the install target to the successor and tells
/// the user.
#[test]
fn test_eol_rebase() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let old_ref = format!("app/org.acme.Old/{arch}/stable");
    let new_ref = format!("app/org.acme.New/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &old_ref, &[("bin/old", b"old")]);
    publish(&fx, &repo, &mut summary, &new_ref, &[("bin/new", b"new")]);
    summary.sparse.insert(
        old_ref.clone(),
        SparseRefInfo {
            eol: None,
            eol_rebase: Some(new_ref.clone()),
        },
    );
    fx.write_summary(&repo, &summary).unwrap();

    let fe = RecordingFrontend::default();
    let mut txn = Transaction::new(&inst, TransactionFlags::default(), Box::new(fe.clone()));
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Old").unwrap(), vec![]);
    txn.run(&cancel()).unwrap();

    assert!(inst.is_installed(&Ref::parse(&new_ref).unwrap()).unwrap());
    assert!(!inst.is_installed(&Ref::parse(&old_ref).unwrap()).unwrap());
    assert!(fe
        .lines()
        .iter()
        .any(|l| l.contains("has been replaced by")));
}

/// A signed summary verifies against the configured key; a signature
/// from the wrong key is never tolerated.
#[test]
fn test_summary_signature() {
    let fx = Fixture::new().unwrap();
    let inst = fx.installation().unwrap();
    let repo = fx.remote_repo().unwrap();
    inst.add_remote(&RemoteConfig {
        name: "origin".into(),
        url: format!("file://{}", fx.path.join("remote")),
        gpg_verify: true,
        trusted_key: Some("k1".into()),
        ..Default::default()
    })
    .unwrap();

    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Signed/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &app_ref, &[("bin/s", b"s")]);
    fx.write_summary_signed(&repo, &summary, b"k1").unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Signed").unwrap(), vec![]);
    txn.run(&cancel()).unwrap();
    assert!(inst.is_installed(&Ref::parse(&app_ref).unwrap()).unwrap());

    // Re-sign with the wrong key: the next transaction refuses
    fx.write_summary_signed(&repo, &summary, b"evil").unwrap();
    let flags = TransactionFlags {
        reinstall: true,
        ..Default::default()
    };
    let mut txn = Transaction::new(&inst, flags, Box::new(RecordingFrontend::default()));
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Signed").unwrap(), vec![]);
    let e = txn.run(&cancel()).unwrap_err();
    assert!(matches!(
        e.downcast_ref::<Error>(),
        Some(Error::GpgUntrusted(_))
    ));
}

/// Locale-related refs are trimmed to the configured languages and
/// leave together with their primary.
#[test]
fn test_locale_related_refs() {
    let (fx, inst, repo) = setup();
    config::set(&inst, config::KEY_LANGUAGES, "de").unwrap();

    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Words/{arch}/stable");
    let loc_ref = format!("runtime/org.acme.Words.Locale/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &app_ref, &[("bin/words", b"elf")]);
    publish(
        &fx,
        &repo,
        &mut summary,
        &loc_ref,
        &[("de/words.mo", b"de"), ("fr/words.mo", b"fr")],
    );
    summary.refs.get_mut(&app_ref).unwrap().related = vec![RelatedRef {
        refname: loc_ref.clone(),
        should_download: true,
        delete_with_primary: true,
        autoprune: false,
        subpaths: vec!["/de".into(), "/fr".into()],
    }];
    fx.write_summary(&repo, &summary).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Words").unwrap(), vec![]);
    txn.run(&cancel()).unwrap();

    let loc = Ref::parse(&loc_ref).unwrap();
    assert!(inst.is_installed(&loc).unwrap());
    let data = inst.load_deploy_data(&loc).unwrap();
    assert_eq!(data.subpaths, vec!["/de".to_string()]);
    assert_eq!(data.related_to.as_deref(), Some(app_ref.as_str()));
    assert!(data.delete_with_primary);

    // Uninstalling the app takes the locale with it
    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_uninstall(PartialRef::parse(&app_ref).unwrap());
    txn.run(&cancel()).unwrap();
    assert!(inst.list_installed_refs().unwrap().is_empty());
}

/// A failing op does not stop independent ops, but its dependents are
/// skipped.
#[test]
fn test_failure_skips_dependents() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let rt_ref = format!("runtime/org.acme.Ghost/{arch}/1");
    let app_ref = format!("app/org.acme.Needy/{arch}/stable");
    let solo_ref = format!("app/org.acme.Solo/{arch}/stable");
    let mut summary = Summary::default();
    // The runtime's commit is advertised but its objects don't exist
    let ghost_commit = ObjectId::digest(b"not actually published").unwrap();
    summary
        .refs
        .insert(rt_ref.clone(), Fixture::summary_ref(&ghost_commit));
    publish(&fx, &repo, &mut summary, &app_ref, &[("bin/needy", b"n")]);
    summary.refs.get_mut(&app_ref).unwrap().runtime_ref = Some(rt_ref.clone());
    publish(&fx, &repo, &mut summary, &solo_ref, &[("bin/solo", b"s")]);
    fx.write_summary(&repo, &summary).unwrap();

    let fe = RecordingFrontend::default();
    let mut txn = Transaction::new(&inst, TransactionFlags::default(), Box::new(fe.clone()));
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Needy").unwrap(), vec![]);
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Solo").unwrap(), vec![]);
    let e = txn.run(&cancel()).unwrap_err();
    assert!(matches!(
        e.downcast_ref::<Error>(),
        Some(Error::NetworkError(_))
    ));

    // The independent app still made it
    assert!(inst.is_installed(&Ref::parse(&solo_ref).unwrap()).unwrap());
    assert!(!inst.is_installed(&Ref::parse(&app_ref).unwrap()).unwrap());
    let lines = fe.lines();
    assert!(lines.iter().any(|l| l.contains(&format!("end install:{rt_ref} failed"))));
    assert!(lines
        .iter()
        .any(|l| l.contains(&format!("end install:{app_ref} skipped"))));
}

/// Install without reinstall over an installed ref refuses up front.
#[test]
fn test_already_installed() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Twice/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &app_ref, &[("bin/t", b"t")]);
    fx.write_summary(&repo, &summary).unwrap();

    for expect_err in [false, true] {
        let mut txn = Transaction::new(
            &inst,
            TransactionFlags::default(),
            Box::new(RecordingFrontend::default()),
        );
        txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Twice").unwrap(), vec![]);
        let r = txn.run(&cancel());
        if expect_err {
            assert!(matches!(
                r.unwrap_err().downcast_ref::<Error>(),
                Some(Error::AlreadyInstalled(_))
            ));
        } else {
            r.unwrap();
        }
    }
}

/// Queuing the same target twice folds into one operation.
#[test]
fn test_fingerprint_dedup() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Once/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &app_ref, &[("bin/o", b"o")]);
    fx.write_summary(&repo, &summary).unwrap();

    let fe = RecordingFrontend::default();
    let mut txn = Transaction::new(&inst, TransactionFlags::default(), Box::new(fe.clone()));
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Once").unwrap(), vec![]);
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Once").unwrap(), vec![]);
    let r = txn.run(&cancel()).unwrap();
    assert_eq!(r.executed, 1);
    assert_eq!(fe.lines()[0], format!("ready [install:{app_ref}]"));
}

/// The frontend can abort at the plan stage; nothing runs and nothing
/// prints as an error.
#[test]
fn test_frontend_abort() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Never/{arch}/stable");
    let mut summary = Summary::default();
    publish(&fx, &repo, &mut summary, &app_ref, &[("bin/n", b"n")]);
    fx.write_summary(&repo, &summary).unwrap();

    let fe = RecordingFrontend::default();
    fe.set_ready_answer(Readiness::Abort);
    let mut txn = Transaction::new(&inst, TransactionFlags::default(), Box::new(fe));
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Never").unwrap(), vec![]);
    let e = txn.run(&cancel()).unwrap_err();
    assert!(appdepot_lib::is_aborted(&e));
    assert!(inst.list_installed_refs().unwrap().is_empty());
}

/// A second process-like handle on the same installation cannot take
/// the lock while a transaction holds it.
#[test]
fn test_lock_busy() {
    let fx = Fixture::new().unwrap();
    let a = fx.installation().unwrap();
    let b = fx.installation().unwrap();
    let _guard = a.lock_exclusive().unwrap();
    let e = b.lock_exclusive().unwrap_err();
    assert!(matches!(e.downcast_ref::<Error>(), Some(Error::Busy(_))));
}

/// Updates pull the new commit, retire the old deployment and record
/// the previous deployment id.
#[test]
fn test_update_replaces_deployment() {
    let (fx, inst, repo) = setup();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Up/{arch}/stable");
    let mut summary = Summary::default();
    let c1 = publish(&fx, &repo, &mut summary, &app_ref, &[("bin/up", b"v1")]);
    fx.write_summary(&repo, &summary).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install(Some("origin".into()), PartialRef::parse("org.acme.Up").unwrap(), vec![]);
    txn.run(&cancel()).unwrap();

    // Publish v2 under the same ref
    let c2 = fx.commit_sample_tree(&repo, &[("bin/up", b"v2")]);
    summary.refs.get_mut(&app_ref).unwrap().commit = c2.clone();
    fx.write_summary(&repo, &summary).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_update(PartialRef::parse("org.acme.Up").unwrap(), None);
    let r = txn.run(&cancel()).unwrap();
    assert_eq!(r.executed, 1);

    let data = inst.load_deploy_data(&Ref::parse(&app_ref).unwrap()).unwrap();
    assert_eq!(data.commit, c2);
    assert_eq!(data.previous_id.as_deref(), Some(c1.as_str()));

    // Already current: a second update resolves to an empty plan
    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_update(PartialRef::parse("org.acme.Up").unwrap(), None);
    let r = txn.run(&cancel()).unwrap();
    assert_eq!(r.executed, 0);
}

/// Bundles install through a synthesized origin remote.
#[test]
fn test_install_bundle() {
    let fx = Fixture::new().unwrap();
    let inst = fx.installation().unwrap();
    let arch = Fixture::arch();
    let app_ref = format!("app/org.acme.Boxed/{arch}/stable");

    // Build the bundle from a scratch repository
    let scratch = fx.remote_repo().unwrap();
    let commit = fx.commit_sample_tree(&scratch, &[("bin/boxed", b"elf")]);
    let delta = appdepot_lib::store::StaticDelta::build(&scratch, None, &commit).unwrap();
    let mut bundle = appdepot_lib::bundle::Bundle {
        refname: Ref::parse(&app_ref).unwrap(),
        origin_url: None,
        runtime_repo: None,
        signature: None,
        delta,
    };
    bundle.sign(b"bundle-key").unwrap();
    let bundle_path = fx.path.join("boxed.appdepot");
    bundle.write(&bundle_path).unwrap();

    let mut txn = Transaction::new(
        &inst,
        TransactionFlags::default(),
        Box::new(RecordingFrontend::default()),
    );
    txn.add_install_bundle(bundle_path, vec![b"bundle-key".to_vec()]);
    let r = txn.run(&cancel()).unwrap();
    assert_eq!(r.executed, 1);
    assert!(inst.is_installed(&Ref::parse(&app_ref).unwrap()).unwrap());
    // The synthesized origin remote exists and is disabled (no url)
    let origin = inst.load_remote("org.acme.Boxed-origin").unwrap();
    assert!(origin.disabled);
}
