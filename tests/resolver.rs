//! Resolution engine scenarios, run against stub sources and a scratch
//! cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use agent_finder::cache::ScrapeCache;
use agent_finder::engine::Resolver;
use agent_finder::errors::FetchError;
use agent_finder::gateway::shared_http_client;
use agent_finder::models::{AgentInfo, LookupStatus, Property, ScrapeResult};
use agent_finder::scrapers::AgentSource;

enum Behavior {
    /// Always answer with this agent (or a clean miss).
    Fixed(Option<AgentInfo>),
    /// Always fail at the transport/schema level.
    Fail,
    /// Answer only once the query no longer carries a unit token.
    UnitFree(AgentInfo),
    /// Panic mid-row.
    Panic,
}

struct StubSource {
    name: String,
    behavior: Behavior,
    calls: AtomicUsize,
}

impl StubSource {
    fn new(name: &str, behavior: Behavior) -> Arc<StubSource> {
        Arc::new(StubSource {
            name: name.to_owned(),
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentSource for StubSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, prop: &Property) -> Result<Option<AgentInfo>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Fixed(agent) => Ok(agent.clone()),
            Behavior::Fail => Err(FetchError::Schema("stub failure".to_owned())),
            Behavior::UnitFree(agent) => {
                if prop.address_line.to_uppercase().contains("APT") {
                    Ok(None)
                } else {
                    Ok(Some(agent.clone()))
                }
            }
            Behavior::Panic => panic!("stub panicked"),
        }
    }
}

fn agent(name: &str, phone: &str, email: &str, source: &str) -> AgentInfo {
    AgentInfo {
        agent_name: name.to_owned(),
        brokerage: "ABC Realty".to_owned(),
        phone: phone.to_owned(),
        email: email.to_owned(),
        source: source.to_owned(),
        ..AgentInfo::default()
    }
}

fn springfield_property() -> Property {
    Property {
        raw_address: "123 Main St, Springfield, IL 62704".to_owned(),
        address_line: "123 MAIN ST".to_owned(),
        city: "SPRINGFIELD".to_owned(),
        state: "IL".to_owned(),
        zip_code: "62704".to_owned(),
        row_index: 0,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    cache: ScrapeCache,
}

impl Harness {
    fn new() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScrapeCache::with_default_ttl(dir.path().join("cache.db"));
        Harness { _dir: dir, cache }
    }

    fn resolver(&self, sources: Vec<Arc<dyn AgentSource>>) -> Resolver {
        self.resolver_with_concurrency(sources, 50)
    }

    fn resolver_with_concurrency(
        &self,
        sources: Vec<Arc<dyn AgentSource>>,
        max_concurrent: usize,
    ) -> Resolver {
        Resolver::new(
            sources,
            self.cache.clone(),
            shared_http_client(),
            // Enrichment reaches for the network; keep it off in tests.
            false,
            max_concurrent,
            None,
        )
    }
}

async fn run(resolver: &Resolver, properties: &[Property]) -> Vec<ScrapeResult> {
    resolver.run(properties).await.unwrap()
}

#[tokio::test]
async fn single_source_hit_is_found_but_unverified() {
    let harness = Harness::new();
    let redfin = StubSource::new(
        "redfin",
        Behavior::Fixed(Some(agent("Jane Doe", "(555) 111-2222", "", "redfin"))),
    );
    let resolver = harness.resolver(vec![redfin.clone()]);

    let results = run(&resolver, &[springfield_property()]).await;
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.status, LookupStatus::Found);
    assert!((result.confidence - 0.5).abs() < 1e-9);
    assert!(!result.verified);
    assert_eq!(result.sources_matched, vec!["redfin".to_owned()]);
    assert!(result.agent_info.as_ref().unwrap().has_contact_info());

    let stats = harness.cache.stats().await.unwrap();
    assert_eq!(stats.cached_results, 1);
    assert_eq!(stats.recorded_failures, 0);
}

#[tokio::test]
async fn two_agreeing_sources_merge_and_verify() {
    let harness = Harness::new();
    let redfin = StubSource::new(
        "redfin",
        Behavior::Fixed(Some(agent("Jane Doe", "(555) 111-2222", "", "redfin"))),
    );
    let realtor = StubSource::new(
        "realtor",
        Behavior::Fixed(Some(agent(
            "Jane Doe",
            "",
            "jane@abcrealty.com",
            "realtor",
        ))),
    );
    let resolver = harness.resolver(vec![redfin, realtor]);

    let results = run(&resolver, &[springfield_property()]).await;
    let result = &results[0];
    assert_eq!(result.status, LookupStatus::Found);
    let info = result.agent_info.as_ref().unwrap();
    assert_eq!(info.phone, "(555) 111-2222");
    assert_eq!(info.email, "jane@abcrealty.com");
    assert_eq!(info.source, "redfin+realtor");
    assert!(result.confidence >= 0.8);
    assert!(result.verified);
    assert_eq!(result.sources_matched.len(), 2);
}

#[tokio::test]
async fn early_exit_skips_later_sources_once_complete_and_agreed() {
    let harness = Harness::new();
    let redfin = StubSource::new(
        "redfin",
        Behavior::Fixed(Some(agent("Jane Doe", "(555) 111-2222", "", "redfin"))),
    );
    let realtor = StubSource::new(
        "realtor",
        Behavior::Fixed(Some(agent("Jane Doe", "", "", "realtor"))),
    );
    let zillow = StubSource::new(
        "zillow",
        Behavior::Fixed(Some(agent("Jane Doe", "", "", "zillow"))),
    );
    let resolver = harness.resolver(vec![redfin, realtor, zillow.clone()]);

    let results = run(&resolver, &[springfield_property()]).await;
    assert_eq!(results[0].sources_tried, vec!["redfin", "realtor"]);
    assert_eq!(zillow.calls(), 0);
}

#[tokio::test]
async fn second_pass_recovers_with_unit_stripped_variant() {
    let harness = Harness::new();
    let redfin = StubSource::new(
        "redfin",
        Behavior::UnitFree(agent("Jane Doe", "(555) 111-2222", "", "redfin")),
    );
    let prop = Property {
        raw_address: "456 Oak Ave APT 3B, Boston, MA".to_owned(),
        address_line: "456 OAK AVE APT 3B".to_owned(),
        city: "BOSTON".to_owned(),
        state: "MA".to_owned(),
        zip_code: String::new(),
        row_index: 0,
    };
    let resolver = harness.resolver(vec![redfin]);

    let results = run(&resolver, &[prop.clone()]).await;
    let result = &results[0];
    assert_eq!(result.status, LookupStatus::Found);
    let info = result.agent_info.as_ref().unwrap();
    assert!(info.source.ends_with("+retry"), "source was {:?}", info.source);
    // The result is reported against the original property.
    assert_eq!(result.property.raw_address, prop.raw_address);

    // Recovery is cached under the original query, so a second run is a
    // pure cache hit.
    let cached = harness.cache.get(&prop.search_query()).await.unwrap();
    assert!(cached.is_some());
}

#[tokio::test]
async fn second_run_is_fully_cached() {
    let harness = Harness::new();
    let redfin = StubSource::new(
        "redfin",
        Behavior::Fixed(Some(agent("Jane Doe", "(555) 111-2222", "", "redfin"))),
    );
    let properties: Vec<Property> = (0..3)
        .map(|i| Property {
            raw_address: format!("{} Main St, Springfield, IL 62704", 100 + i),
            address_line: format!("{} MAIN ST", 100 + i),
            city: "SPRINGFIELD".to_owned(),
            state: "IL".to_owned(),
            zip_code: "62704".to_owned(),
            row_index: i,
        })
        .collect();

    let resolver = harness.resolver(vec![redfin.clone()]);
    let first = run(&resolver, &properties).await;
    assert!(first.iter().all(|r| r.status == LookupStatus::Found));
    let calls_after_first = redfin.calls();

    let resolver = harness.resolver(vec![redfin.clone()]);
    let second = run(&resolver, &properties).await;
    assert!(second.iter().all(|r| r.status == LookupStatus::Cached));
    assert_eq!(redfin.calls(), calls_after_first);
}

#[tokio::test]
async fn duplicate_rows_resolve_once_but_emit_per_row() {
    let harness = Harness::new();
    let redfin = StubSource::new(
        "redfin",
        Behavior::Fixed(Some(agent("Jane Doe", "(555) 111-2222", "", "redfin"))),
    );
    let mut first = springfield_property();
    first.row_index = 0;
    let mut second = springfield_property();
    second.row_index = 1;

    let resolver = harness.resolver(vec![redfin.clone()]);
    let results = run(&resolver, &[first, second]).await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == LookupStatus::Found));
    assert_eq!(results[0].property.row_index, 0);
    assert_eq!(results[1].property.row_index, 1);
    assert_eq!(redfin.calls(), 1);
}

#[tokio::test]
async fn circuit_opens_after_ten_consecutive_failures() {
    let harness = Harness::new();
    let failing = StubSource::new("failing", Behavior::Fail);
    let working = StubSource::new(
        "working",
        Behavior::Fixed(Some(agent("Jane Doe", "(555) 111-2222", "", "working"))),
    );

    let properties: Vec<Property> = (0..12)
        .map(|i| Property {
            raw_address: format!("{} Elm St, Springfield, IL 62704", i),
            address_line: format!("{} ELM ST", i),
            city: "SPRINGFIELD".to_owned(),
            state: "IL".to_owned(),
            zip_code: "62704".to_owned(),
            row_index: i,
        })
        .collect();

    // Sequential rows so breaker state is deterministic.
    let resolver =
        harness.resolver_with_concurrency(vec![failing.clone(), working], 1);
    let results = run(&resolver, &properties).await;

    assert!(results.iter().all(|r| r.status == LookupStatus::Found));
    // Ten failures trip the breaker; the remaining rows skip the source.
    assert_eq!(failing.calls(), 10);
    assert_eq!(results[11].sources_tried, vec!["working"]);
    assert_eq!(resolver.tripped_sources(), vec!["failing".to_owned()]);
}

#[tokio::test]
async fn not_found_records_failure_ledger_entry() {
    let harness = Harness::new();
    let redfin = StubSource::new("redfin", Behavior::Fixed(None));
    let resolver = harness.resolver(vec![redfin]);

    // No unit token and no ZIP, so the second pass has no variants to try
    // and exactly one failure is recorded.
    let prop = Property {
        raw_address: "123 Main St, Springfield, IL".to_owned(),
        address_line: "123 MAIN ST".to_owned(),
        city: "SPRINGFIELD".to_owned(),
        state: "IL".to_owned(),
        zip_code: String::new(),
        row_index: 0,
    };
    let results = run(&resolver, &[prop]).await;
    assert_eq!(results[0].status, LookupStatus::NotFound);
    assert!(results[0].agent_info.is_none());

    let stats = harness.cache.stats().await.unwrap();
    assert_eq!(stats.cached_results, 0);
    assert_eq!(stats.recorded_failures, 1);
}

#[tokio::test]
async fn panicking_row_becomes_error_and_batch_continues() {
    let harness = Harness::new();
    let panicking = StubSource::new("panicking", Behavior::Panic);
    let resolver = harness.resolver(vec![panicking]);

    let mut ok_prop = springfield_property();
    ok_prop.row_index = 1;
    let results = run(&resolver, &[springfield_property(), ok_prop]).await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == LookupStatus::Error));
    assert!(results[0].error_message.contains("panicked"));
}

#[tokio::test]
async fn partial_result_has_name_but_no_contact() {
    let harness = Harness::new();
    let redfin = StubSource::new(
        "redfin",
        Behavior::Fixed(Some(agent("Jane Doe", "", "", "redfin"))),
    );
    let resolver = harness.resolver(vec![redfin]);

    let results = run(&resolver, &[springfield_property()]).await;
    let result = &results[0];
    assert_eq!(result.status, LookupStatus::Partial);
    let info = result.agent_info.as_ref().unwrap();
    assert!(!info.agent_name.is_empty());
    assert!(!info.has_contact_info());
}
