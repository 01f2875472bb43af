//! The multi-source resolution engine.
//!
//! For each address: consult the cache, then walk the source priority list
//! under a waterfall-with-merge discipline — every source that answers
//! contributes missing fields, and two agreeing sources let us exit early
//! with a verified result. A second pass retries not-found rows with
//! simplified address variants.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::{future, FutureExt};
use metrics::counter;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::ScrapeCache;
use crate::config::{CIRCUIT_BREAKER_THRESHOLD, MAX_GLOBAL_CONCURRENCY};
use crate::enrich::enrich_contact_info;
use crate::gateway::{CircuitBreaker, SharedHttpClient};
use crate::models::{AgentInfo, LookupStatus, ProgressEvent, Property, ScrapeResult};
use crate::normalize::{names_match, retry_variants};
use crate::scrapers::google::GoogleSearchSource;
use crate::scrapers::harvest::HarvestSource;
use crate::scrapers::realtor::RealtorSource;
use crate::scrapers::redfin::RedfinSource;
use crate::scrapers::zillow::ZillowSource;
use crate::scrapers::AgentSource;

/// Callback invoked with every progress event the engine emits.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Default source priority for the waterfall.
pub const DEFAULT_SOURCES: &[&str] = &["redfin", "homeharvest", "realtor", "zillow"];

/// Build the ordered source list from enabled source names.
pub fn build_sources(
    enabled: &[String],
    client: &SharedHttpClient,
    google_api_key: &str,
    google_cse_id: &str,
) -> Vec<Arc<dyn AgentSource>> {
    let mut sources: Vec<Arc<dyn AgentSource>> = vec![];
    let enabled: HashSet<&str> = enabled.iter().map(|s| s.as_str()).collect();

    if enabled.contains("redfin") {
        sources.push(Arc::new(RedfinSource::new(client.clone())));
    }
    if enabled.contains("homeharvest") {
        sources.push(Arc::new(HarvestSource::new()));
    }
    if enabled.contains("realtor") {
        sources.push(Arc::new(RealtorSource::new(client.clone())));
    }
    if enabled.contains("zillow") {
        sources.push(Arc::new(ZillowSource::new(client.clone())));
    }
    if enabled.contains("google") || enabled.contains("google_search") {
        let google = GoogleSearchSource::new(
            client.clone(),
            google_api_key.to_owned(),
            google_cse_id.to_owned(),
        );
        if google.is_configured() {
            sources.push(Arc::new(google));
        }
    }

    sources
}

#[derive(Clone, Copy, Debug, Default)]
struct EngineStats {
    total: usize,
    cached: usize,
    found: usize,
    partial: usize,
    not_found: usize,
    errors: usize,
}

impl EngineStats {
    fn completed(&self) -> usize {
        self.found + self.partial + self.not_found + self.errors
    }
}

/// The resolution engine. One instance drives one batch; the cache it
/// holds is what makes re-runs and resumes cheap.
pub struct Resolver {
    sources: Vec<Arc<dyn AgentSource>>,
    cache: ScrapeCache,
    client: SharedHttpClient,
    enrich: bool,
    semaphore: Semaphore,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    stats: Mutex<EngineStats>,
    progress: Option<ProgressCallback>,
}

impl Resolver {
    pub fn new(
        sources: Vec<Arc<dyn AgentSource>>,
        cache: ScrapeCache,
        client: SharedHttpClient,
        enrich: bool,
        max_concurrent: usize,
        progress: Option<ProgressCallback>,
    ) -> Resolver {
        Resolver {
            sources,
            cache,
            client,
            enrich,
            semaphore: Semaphore::new(max_concurrent.max(1)),
            breakers: Mutex::new(HashMap::new()),
            stats: Mutex::new(EngineStats::default()),
            progress,
        }
    }

    pub fn with_defaults(
        sources: Vec<Arc<dyn AgentSource>>,
        cache: ScrapeCache,
        client: SharedHttpClient,
    ) -> Resolver {
        Resolver::new(
            sources,
            cache,
            client,
            true,
            MAX_GLOBAL_CONCURRENCY,
            None,
        )
    }

    /// Run the full pipeline. Returns one `ScrapeResult` per property, in
    /// input order.
    pub async fn run(&self, properties: &[Property]) -> Result<Vec<ScrapeResult>> {
        self.cache.initialize().await?;

        // Partition into cached and pending, preserving order.
        let all_queries: Vec<String> =
            properties.iter().map(|p| p.search_query()).collect();
        let pending_set: HashSet<String> = self
            .cache
            .pending_addresses(&all_queries)
            .await?
            .into_iter()
            .collect();

        let mut results: Vec<Option<ScrapeResult>> = Vec::with_capacity(properties.len());
        // (slot in `results`, property, query) for every non-cached row.
        let mut pending_rows: Vec<(usize, Property, String)> = vec![];

        for (prop, query) in properties.iter().zip(&all_queries) {
            if !pending_set.contains(query) {
                if let Some(cached_info) = self.cache.get(query).await? {
                    self.stats.lock().unwrap().cached += 1;
                    let mut result = ScrapeResult::new(prop.clone());
                    result.agent_info = Some(cached_info);
                    result.status = LookupStatus::Cached;
                    results.push(Some(result));
                    continue;
                }
            }
            pending_rows.push((results.len(), prop.clone(), query.clone()));
            results.push(None);
        }

        // Duplicate input rows share one resolution: scrape each unique
        // query once and copy the outcome onto every row that asked.
        let mut unique_index: HashMap<String, usize> = HashMap::new();
        let mut unique_props: Vec<Property> = vec![];
        for (_, prop, query) in &pending_rows {
            if !unique_index.contains_key(query) {
                unique_index.insert(query.clone(), unique_props.len());
                unique_props.push(prop.clone());
            }
        }

        // One up-front event so subscribers see the cached rows and the
        // correct denominator (unique pending work) immediately.
        {
            let mut stats = self.stats.lock().unwrap();
            stats.total = unique_props.len();
        }
        self.emit_progress("", "cached");

        if unique_props.is_empty() {
            let cached = self.stats.lock().unwrap().cached;
            info!("all {} addresses served from cache", cached);
            return Ok(results.into_iter().flatten().collect());
        }
        info!(
            "processing {} unique addresses ({} rows, {} cached)",
            unique_props.len(),
            pending_rows.len(),
            self.stats.lock().unwrap().cached
        );

        // Resolve every unique query, bounded by the global semaphore. A
        // panicking row becomes an ERROR result; the batch continues.
        let scraped = future::join_all(unique_props.iter().map(|prop| {
            let prop = prop.clone();
            async move {
                let attempt =
                    AssertUnwindSafe(self.process_one(prop.clone(), true))
                        .catch_unwind()
                        .await;
                match attempt {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic);
                        warn!(
                            "row task failed for {:?}: {}",
                            prop.raw_address, message
                        );
                        self.stats.lock().unwrap().errors += 1;
                        self.emit_progress(&prop.raw_address, "error");
                        let mut result = ScrapeResult::new(prop);
                        result.status = LookupStatus::Error;
                        result.error_message = message;
                        result
                    }
                }
            }
        }))
        .await;

        // Copy each unique outcome onto every row that shares its query,
        // restoring the row's own property.
        for (slot, prop, query) in pending_rows {
            let resolved = &scraped[unique_index[&query]];
            let mut row_result = resolved.clone();
            row_result.property = prop;
            results[slot] = Some(row_result);
        }
        let mut results: Vec<ScrapeResult> = results.into_iter().flatten().collect();

        // Second pass: retry not-found rows with simplified queries, again
        // once per unique query.
        let mut retry_index: HashMap<String, usize> = HashMap::new();
        let mut retry_groups: Vec<Vec<usize>> = vec![];
        for (i, result) in results.iter().enumerate() {
            if result.status != LookupStatus::NotFound {
                continue;
            }
            let query = result.property.search_query();
            match retry_index.get(&query).copied() {
                Some(group) => retry_groups[group].push(i),
                None => {
                    retry_index.insert(query, retry_groups.len());
                    retry_groups.push(vec![i]);
                }
            }
        }

        if !retry_groups.is_empty() {
            info!(
                "retrying {} not-found addresses with simplified queries",
                retry_groups.len()
            );
            self.emit_progress("Retrying not-found addresses...", "retrying");

            let retry_inputs: Vec<Property> = retry_groups
                .iter()
                .map(|group| results[group[0]].property.clone())
                .collect();
            let retries = future::join_all(
                retry_inputs
                    .into_iter()
                    .map(|prop| self.retry_with_variants(prop)),
            )
            .await;

            let mut recovered = 0;
            for (group, retry) in retry_groups.iter().zip(retries) {
                let Some(retry_result) = retry else {
                    continue;
                };
                let has_contact = retry_result
                    .agent_info
                    .as_ref()
                    .map(AgentInfo::has_contact_info)
                    .unwrap_or(false);
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.not_found = stats.not_found.saturating_sub(1);
                    if has_contact {
                        stats.found += 1;
                    } else {
                        stats.partial += 1;
                    }
                }
                for &idx in group {
                    let mut row_result = retry_result.clone();
                    row_result.property = results[idx].property.clone();
                    results[idx] = row_result;
                }
                recovered += 1;
            }
            if recovered > 0 {
                info!("retry pass recovered {} addresses", recovered);
                counter!("agentfinder.retry_recovered.total", recovered as u64);
            }
        }

        Ok(results)
    }

    /// Resolve one property through the scraper waterfall.
    ///
    /// `count` is false during the retry pass so the cumulative stats
    /// aren't double-counted; the retry handler adjusts them itself.
    async fn process_one(&self, prop: Property, count: bool) -> ScrapeResult {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("engine semaphore never closes");

        let mut sources_tried: Vec<String> = vec![];
        let mut agent_info: Option<AgentInfo> = None;
        // (source name, agent name) pairs for confidence scoring.
        let mut source_agents: Vec<(String, String)> = vec![];

        for source in &self.sources {
            let name = source.name().to_owned();
            if self.is_circuit_open(&name) {
                continue;
            }
            sources_tried.push(name.clone());

            match source.search(&prop).await {
                Ok(found) => {
                    self.record_source_success(&name);
                    if let Some(result) = found {
                        if !result.agent_name.is_empty() {
                            source_agents.push((name, result.agent_name.clone()));
                            agent_info = Some(match agent_info {
                                None => result,
                                Some(acc) => acc.merge(&result),
                            });
                            // Early exit: complete info and two sources agree
                            // that there is an agent here at all.
                            let complete = agent_info
                                .as_ref()
                                .map(AgentInfo::is_complete)
                                .unwrap_or(false);
                            if complete && source_agents.len() >= 2 {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    self.record_source_failure(&name);
                    debug!(
                        "source {} failed for {:?}: {}",
                        name, prop.raw_address, err
                    );
                }
            }
        }

        let (confidence, verified) = compute_confidence(&source_agents);

        // Enrich when we have a name but no contact channel.
        if self.enrich {
            if let Some(info) = &agent_info {
                if !info.is_complete() {
                    agent_info = Some(enrich_contact_info(info, &self.client).await);
                }
            }
        }

        // Classify and persist.
        let query = prop.search_query();
        let status = match &agent_info {
            Some(info) if !info.agent_name.is_empty() => {
                let status = if info.has_contact_info() {
                    LookupStatus::Found
                } else {
                    LookupStatus::Partial
                };
                if let Err(err) = self.cache.put(&query, info, status).await {
                    warn!("cache write failed for {:?}: {}", query, err);
                }
                status
            }
            _ => {
                agent_info = None;
                if let Err(err) = self
                    .cache
                    .record_failure(&query, &sources_tried, "No agent info found")
                    .await
                {
                    warn!("failure ledger write failed for {:?}: {}", query, err);
                }
                LookupStatus::NotFound
            }
        };

        if count {
            {
                let mut stats = self.stats.lock().unwrap();
                match status {
                    LookupStatus::Found => stats.found += 1,
                    LookupStatus::Partial => stats.partial += 1,
                    LookupStatus::NotFound => stats.not_found += 1,
                    _ => {}
                }
            }
            counter!("agentfinder.addresses.total", 1, "status" => status.to_string());
            self.emit_progress(&prop.raw_address, &status.to_string());
        }

        ScrapeResult {
            property: prop,
            agent_info,
            status,
            sources_tried,
            error_message: String::new(),
            confidence,
            verified,
            sources_matched: source_agents.into_iter().map(|(name, _)| name).collect(),
        }
    }

    /// Retry a not-found property with simplified address variants. On
    /// recovery the result is re-cached under the original query so the
    /// next run is a cache hit, and the source tag gains `+retry`.
    async fn retry_with_variants(&self, prop: Property) -> Option<ScrapeResult> {
        for variant in retry_variants(&prop) {
            // The variant string already embeds city/state/zip.
            let variant_prop = Property {
                raw_address: prop.raw_address.clone(),
                address_line: variant,
                city: String::new(),
                state: String::new(),
                zip_code: String::new(),
                row_index: prop.row_index,
            };

            let mut result = self.process_one(variant_prop, false).await;
            let recovered = result
                .agent_info
                .as_ref()
                .map(|info| !info.agent_name.is_empty())
                .unwrap_or(false);
            if recovered {
                if let Some(info) = &mut result.agent_info {
                    info.source = format!("{}+retry", info.source);
                }
                if let Some(info) = &result.agent_info {
                    if let Err(err) = self
                        .cache
                        .put(&prop.search_query(), info, result.status)
                        .await
                    {
                        warn!("retry cache write failed: {}", err);
                    }
                }
                result.property = prop;
                return Some(result);
            }
        }
        None
    }

    // ── Circuit breaker ──

    fn is_circuit_open(&self, source_name: &str) -> bool {
        self.breakers
            .lock()
            .unwrap()
            .get(source_name)
            .map(CircuitBreaker::is_open)
            .unwrap_or(false)
    }

    fn record_source_success(&self, source_name: &str) {
        self.breakers
            .lock()
            .unwrap()
            .entry(source_name.to_owned())
            .or_default()
            .record_success();
    }

    fn record_source_failure(&self, source_name: &str) {
        let opened = self
            .breakers
            .lock()
            .unwrap()
            .entry(source_name.to_owned())
            .or_default()
            .record_failure(CIRCUIT_BREAKER_THRESHOLD);
        if opened {
            warn!(
                "circuit breaker OPEN for {} after {} consecutive failures",
                source_name, CIRCUIT_BREAKER_THRESHOLD
            );
            counter!("agentfinder.circuit_opened.total", 1, "source" => source_name.to_owned());
        }
    }

    /// Sources whose circuits are currently open, for the summary.
    pub fn tripped_sources(&self) -> Vec<String> {
        self.breakers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, breaker)| breaker.is_open())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn emit_progress(&self, current_address: &str, current_status: &str) {
        let Some(callback) = &self.progress else {
            return;
        };
        let stats = *self.stats.lock().unwrap();
        callback(ProgressEvent {
            completed: stats.completed(),
            total: stats.total,
            cached: stats.cached,
            found: stats.found,
            partial: stats.partial,
            not_found: stats.not_found,
            errors: stats.errors,
            current_address: current_address.to_owned(),
            current_status: current_status.to_owned(),
        });
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "row task panicked".to_owned()
    }
}

/// Agreement-based confidence:
/// no sources 0.0; one source 0.5 unverified; with two or more, fuzzy-match
/// every later name against the first — `M >= 2` matches give
/// `min(0.7 + 0.1·M, 1.0)` verified, disagreement gives 0.4 unverified.
fn compute_confidence(source_agents: &[(String, String)]) -> (f64, bool) {
    if source_agents.is_empty() {
        return (0.0, false);
    }
    if source_agents.len() == 1 {
        return (0.5, false);
    }

    let base_name = &source_agents[0].1;
    let mut matching = 1usize;
    for (_, name) in &source_agents[1..] {
        if names_match(base_name, name) {
            matching += 1;
        }
    }

    if matching >= 2 {
        let confidence = (0.7 + matching as f64 * 0.1).min(1.0);
        (confidence, true)
    } else {
        (0.4, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents(names: &[&str]) -> Vec<(String, String)> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| (format!("source{}", i), (*name).to_owned()))
            .collect()
    }

    #[test]
    fn confidence_tiers() {
        assert_eq!(compute_confidence(&[]), (0.0, false));
        assert_eq!(compute_confidence(&agents(&["Jane Doe"])), (0.5, false));

        let (confidence, verified) =
            compute_confidence(&agents(&["Jane Doe", "jane doe"]));
        assert!((confidence - 0.9).abs() < 1e-9);
        assert!(verified);

        let (confidence, verified) =
            compute_confidence(&agents(&["Jane Doe", "Robert Smith"]));
        assert!((confidence - 0.4).abs() < 1e-9);
        assert!(!verified);
    }

    #[test]
    fn confidence_caps_at_one() {
        let names = ["Jane Doe", "Jane Doe", "Jane Doe", "Jane Doe", "Jane Doe"];
        let (confidence, verified) = compute_confidence(&agents(&names));
        assert!((confidence - 1.0).abs() < 1e-9);
        assert!(verified);
    }
}
