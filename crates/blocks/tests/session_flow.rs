use async_trait::async_trait;
use context_blocks::{
    Assembler, AssemblyStatus, Block, BlockStore, Delegation, DelegationHook, Document,
    HookRegistry, InclusionTracker, LoadError, RetrievalError, TaskContext, Trigger,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};

struct Unreachable;

#[async_trait]
impl DelegationHook for Unreachable {
    fn name(&self) -> &str {
        "context-fetcher"
    }

    async fn resolve(&self, block: &Block, _ctx: &TaskContext) -> Result<String, RetrievalError> {
        Err(RetrievalError::Agent {
            agent: "context-fetcher".to_string(),
            message: format!("no index for {}", block.name()),
        })
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn tagged_store() -> BlockStore {
    BlockStore::from_blocks(vec![
        Block::new("mission", Trigger::Always, "Mission"),
        Block::new("tests", Trigger::tags(["testing"]), "Testing guide"),
        Block::new("api", Trigger::tags(["api", "http"]), "API guide"),
        Block::new("style", Trigger::path("lib/**/*.ex").unwrap(), "Style guide"),
        Block::new("deploy", Trigger::mentions(["deploy"]).unwrap(), "Deploy checklist"),
    ])
    .unwrap()
}

#[tokio::test]
async fn scenario_a_always_block_is_emitted_once() {
    let store = BlockStore::load([Document::new("core.md", "X")]).unwrap();
    let tracker = InclusionTracker::new();
    let assembler = Assembler::default();
    let ctx = TaskContext::new();

    let first = assembler.resolve(&ctx, &store, &tracker).await.unwrap();
    assert_eq!(first.texts().collect::<Vec<_>>(), vec!["X"]);
    assert!(tracker.is_seen("core"));
    assert_eq!(tracker.len(), 1);

    let second = assembler.resolve(&ctx, &store, &tracker).await.unwrap();
    assert!(second.is_empty());
    assert!(second.errors.is_empty());
}

#[test]
fn scenario_b_duplicate_names_fail_to_load() {
    let err = BlockStore::load([
        Document::new("a.md", "+++\nname = \"shared\"\n+++\none"),
        Document::new("b.md", "+++\nname = \"shared\"\n+++\ntwo"),
    ])
    .unwrap_err();
    assert!(matches!(err, LoadError::DuplicateName { ref name, .. } if name == "shared"));
}

#[tokio::test]
async fn scenario_c_failed_delegation_keeps_other_blocks() {
    let store = BlockStore::from_blocks(vec![
        Block::new("before", Trigger::Always, "B"),
        Block::new("remote", Trigger::Always, "").with_delegate(Delegation::via("context-fetcher")),
        Block::new("after", Trigger::Always, "A"),
    ])
    .unwrap();
    let mut hooks = HookRegistry::new();
    hooks.register(Arc::new(Unreachable));
    let tracker = InclusionTracker::new();

    let out = Assembler::new(hooks)
        .resolve(&TaskContext::new(), &store, &tracker)
        .await
        .unwrap();

    assert_eq!(out.names().collect::<Vec<_>>(), vec!["before", "after"]);
    assert_eq!(out.status, AssemblyStatus::PartialFailure);
    assert_eq!(out.errors.len(), 1);
    assert_eq!(out.errors[0].block, "remote");
    assert_eq!(
        out.errors[0].error,
        RetrievalError::Agent {
            agent: "context-fetcher".to_string(),
            message: "no index for remote".to_string(),
        }
    );
}

#[test]
fn scenario_d_concurrent_calls_include_block_once() {
    let store = Arc::new(
        BlockStore::from_blocks(vec![Block::new("shared", Trigger::tags(["api"]), "S")]).unwrap(),
    );
    let ctx = TaskContext::new().with_tag("api");

    for _ in 0..50 {
        let tracker = Arc::new(InclusionTracker::new());
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (store, tracker, barrier, ctx) =
                    (store.clone(), tracker.clone(), barrier.clone(), ctx.clone());
                std::thread::spawn(move || {
                    let rt = runtime();
                    barrier.wait();
                    rt.block_on(Assembler::default().resolve(&ctx, &store, &tracker))
                        .unwrap()
                })
            })
            .collect();

        let outputs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let included: usize = outputs.iter().map(|o| o.entries.len()).sum();
        assert_eq!(included, 1);
        assert!(outputs.iter().all(|o| o.errors.is_empty()));
        assert!(tracker.is_seen("shared"));
    }
}

#[tokio::test]
async fn reset_makes_resolution_idempotent() {
    let store = tagged_store();
    let tracker = InclusionTracker::new();
    let assembler = Assembler::default();
    let ctx = TaskContext::new()
        .with_tags(["testing", "http"])
        .with_file_path("lib/app/router.ex")
        .with_description("Prepare to deploy the router");

    let first = assembler.resolve(&ctx, &store, &tracker).await.unwrap();
    tracker.reset();
    let second = assembler.resolve(&ctx, &store, &tracker).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        first.names().collect::<Vec<_>>(),
        vec!["mission", "tests", "api", "style", "deploy"]
    );
}

#[test]
fn loading_n_documents_yields_n_blocks() {
    let documents: Vec<Document> = (0..12)
        .map(|i| Document::new(format!("blocks/b{i}.md"), format!("body {i}")))
        .collect();
    let store = BlockStore::load(documents).unwrap();
    assert_eq!(store.all_blocks().len(), 12);
}

#[tokio::test]
async fn no_matches_is_empty_not_an_error() {
    let store = BlockStore::from_blocks(vec![
        Block::new("tests", Trigger::tags(["testing"]), "T"),
        Block::new("style", Trigger::path("**/*.ex").unwrap(), "S"),
    ])
    .unwrap();
    let out = Assembler::default()
        .resolve(&TaskContext::new().with_tag("docs"), &store, &InclusionTracker::new())
        .await
        .unwrap();
    assert!(out.entries.is_empty());
    assert!(out.errors.is_empty());
    assert_eq!(out.status, AssemblyStatus::Complete);
}

fn tag_strategy() -> impl Strategy<Value = Vec<Vec<&'static str>>> {
    let tags = prop::sample::select(vec!["testing", "api", "http", "docs"]);
    prop::collection::vec(prop::collection::vec(tags, 0..3), 1..8)
}

proptest! {
    #[test]
    fn proptest_session_never_repeats_a_block(sequence in tag_strategy()) {
        let store = tagged_store();
        let tracker = InclusionTracker::new();
        let assembler = Assembler::default();
        let rt = runtime();

        let mut emitted = HashSet::new();
        for tags in sequence {
            let ctx = TaskContext::new().with_tags(tags);
            let out = rt.block_on(assembler.resolve(&ctx, &store, &tracker)).unwrap();
            for name in out.names() {
                prop_assert!(emitted.insert(name.to_string()), "{name} emitted twice");
            }
        }
        prop_assert!(emitted.contains("mission"));
        prop_assert_eq!(emitted.len(), tracker.len());
    }
}
