//! End-to-end pipeline tests against the library API, with the network
//! replaced by a stub fetcher.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use atlas::adapter_rss::{poll_feeds, FeedSpec};
use atlas::adapter_url::ingest_url;
use atlas::config::Config;
use atlas::content::{audit_history, get_content};
use atlas::extract::{FetchedPage, Fetcher};
use atlas::models::{BacklogPayload, EmailPayload, JobKind, JobPayload, RssItemPayload, UrlPayload};
use atlas::queue::QueueState;
use atlas::worker::{IterationOutcome, Worker};

const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Systems Weekly</title>
  <item>
    <title>Borrow checker tales</title>
    <link>https://blog.example/borrowck</link>
    <guid>bc-1</guid>
    <description>Short summary</description>
  </item>
</channel></rss>"#;

struct StubWeb;

#[async_trait]
impl Fetcher for StubWeb {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let (content_type, body) = match url {
            "https://blog.example/feed" => ("application/rss+xml", FEED.to_string()),
            "https://blog.example/borrowck" => (
                "text/html; charset=utf-8",
                "<html><head><title>Borrow checker tales</title></head><body>\
                 <nav>menu</nav><article><p>Lifetimes tie references to scopes.</p></article>\
                 </body></html>"
                    .to_string(),
            ),
            "https://example.com/ai" => (
                "text/html",
                "<html><head><title>AI</title></head><body><main><p>technology and \
                 artificial intelligence</p></main></body></html>"
                    .to_string(),
            ),
            "https://example.com/missing" => bail!("HTTP 404 for {}", url),
            _ => bail!("unexpected fetch of {}", url),
        };
        Ok(FetchedPage {
            url: url.to_string(),
            status: 200,
            content_type: Some(content_type.to_string()),
            body,
        })
    }
}

async fn worker(tmp: &TempDir) -> (Config, Worker) {
    let config = Config::rooted_at(tmp.path());
    let worker = Worker::with_fetcher(&config, Arc::new(StubWeb)).await.unwrap();
    (config, worker)
}

async fn drain(worker: &Worker) -> Vec<IterationOutcome> {
    let mut outcomes = Vec::new();
    loop {
        match worker.run_once().await.unwrap() {
            IterationOutcome::Idle => return outcomes,
            other => outcomes.push(other),
        }
    }
}

fn in_exactly_one_dir(worker: &Worker, id: &str) -> Option<QueueState> {
    let name = format!("{}.json", id);
    let present: Vec<QueueState> = QueueState::ALL
        .into_iter()
        .filter(|s| worker.queue().dir(*s).join(&name).exists())
        .collect();
    assert!(present.len() <= 1, "{} found in {:?}", id, present);
    present.first().copied()
}

#[tokio::test]
async fn url_submission_ends_up_searchable() {
    let tmp = TempDir::new().unwrap();
    let (_config, worker) = worker(&tmp).await;

    let job = ingest_url(worker.queue(), "https://example.com/ai", Some("manual")).unwrap();
    assert_eq!(in_exactly_one_dir(&worker, &job.id), Some(QueueState::Inbox));

    let outcomes = drain(&worker).await;
    assert_eq!(outcomes, vec![IterationOutcome::Completed(job.id.clone())]);
    assert_eq!(in_exactly_one_dir(&worker, &job.id), Some(QueueState::Completed));

    let hits = worker.index().search("technology", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, job.id);
    assert_eq!(hits[0].title.as_deref(), Some("AI"));

    let record = get_content(worker.pool(), &job.id).await.unwrap().unwrap();
    assert_eq!(record.source, "manual");
    assert_eq!(record.metadata["final_url"], "https://example.com/ai");
}

#[tokio::test]
async fn claims_follow_priority_order() {
    let tmp = TempDir::new().unwrap();
    let (_config, worker) = worker(&tmp).await;
    let q = worker.queue();

    let backlog = q
        .create_job(
            JobPayload::Backlog(BacklogPayload {
                text: Some("old bookmark".to_string()),
                ..Default::default()
            }),
            "backlog",
            None,
            None,
        )
        .unwrap();
    let url = q
        .create_job(
            JobPayload::Url(UrlPayload {
                url: "https://example.com/ai".to_string(),
                ..Default::default()
            }),
            "manual",
            None,
            None,
        )
        .unwrap();
    let email = q
        .create_job(
            JobPayload::Email(EmailPayload {
                message_id: "<m1@example>".to_string(),
                subject: Some("Digest".to_string()),
                text: Some("newsletter body".to_string()),
                ..Default::default()
            }),
            "gmail",
            None,
            None,
        )
        .unwrap();

    let order: Vec<String> = drain(&worker)
        .await
        .into_iter()
        .map(|o| match o {
            IterationOutcome::Completed(id) => id,
            other => panic!("unexpected outcome {:?}", other),
        })
        .collect();
    assert_eq!(order, vec![email.id, url.id, backlog.id]);
    assert_eq!(q.counts().unwrap().completed, 3);
}

#[tokio::test]
async fn failed_fetch_is_audited_and_requeueable() {
    let tmp = TempDir::new().unwrap();
    let (_config, worker) = worker(&tmp).await;

    let job = ingest_url(worker.queue(), "https://example.com/missing", None).unwrap();
    let outcomes = drain(&worker).await;
    assert_eq!(outcomes, vec![IterationOutcome::Failed(job.id.clone())]);
    assert_eq!(in_exactly_one_dir(&worker, &job.id), Some(QueueState::Failed));

    let report = worker.queue().failure_report(&job.id).unwrap();
    assert!(report.contains("HTTP 404"));

    worker.queue().requeue(&job.id).unwrap();
    assert_eq!(in_exactly_one_dir(&worker, &job.id), Some(QueueState::Inbox));
    assert!(worker.queue().failure_report(&job.id).is_none());

    // Still broken: a second failure adds a second audit row.
    drain(&worker).await;
    let history = audit_history(worker.pool(), &job.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|h| h.status == "failed"));
}

#[tokio::test]
async fn rss_poll_feeds_the_worker() {
    let tmp = TempDir::new().unwrap();
    let (_config, worker) = worker(&tmp).await;
    let feeds = vec![FeedSpec {
        url: "https://blog.example/feed".to_string(),
        name: None,
        source: Some("blogs".to_string()),
    }];

    let summary = poll_feeds(worker.pool(), worker.queue(), &StubWeb, &feeds).await;
    assert_eq!(summary.enqueued, 1);
    let again = poll_feeds(worker.pool(), worker.queue(), &StubWeb, &feeds).await;
    assert_eq!(again.enqueued, 0);

    let outcomes = drain(&worker).await;
    let IterationOutcome::Completed(id) = &outcomes[0] else {
        panic!("rss job failed: {:?}", outcomes);
    };

    let record = get_content(worker.pool(), id).await.unwrap().unwrap();
    assert_eq!(record.content_type, JobKind::RssItem.as_str());
    assert_eq!(record.source, "blogs");
    assert_eq!(record.url.as_deref(), Some("https://blog.example/borrowck"));
    assert_eq!(record.metadata["payload"]["guid"], "bc-1");

    let hits = worker.index().search("lifetimes", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn rss_item_without_link_uses_its_summary() {
    let tmp = TempDir::new().unwrap();
    let (_config, worker) = worker(&tmp).await;

    let job = worker
        .queue()
        .create_job(
            JobPayload::RssItem(RssItemPayload {
                feed_url: "https://pod.example/feed".to_string(),
                guid: "ep-9".to_string(),
                title: Some("Episode 9".to_string()),
                summary: Some("<p>Show notes about compilers</p>".to_string()),
                enclosure_url: Some("https://cdn.example/ep9.mp3".to_string()),
                ..Default::default()
            }),
            "podcasts",
            None,
            None,
        )
        .unwrap();

    drain(&worker).await;
    let record = get_content(worker.pool(), &job.id).await.unwrap().unwrap();
    assert_eq!(record.title.as_deref(), Some("Episode 9"));
    assert_eq!(
        record.metadata["payload"]["enclosure_url"],
        "https://cdn.example/ep9.mp3"
    );
    assert!(!worker.index().search("compilers", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn same_url_twice_gives_two_rows() {
    let tmp = TempDir::new().unwrap();
    let (_config, worker) = worker(&tmp).await;

    let a = ingest_url(worker.queue(), "https://example.com/ai", None).unwrap();
    let b = ingest_url(worker.queue(), "https://example.com/ai", None).unwrap();
    drain(&worker).await;

    assert!(get_content(worker.pool(), &a.id).await.unwrap().is_some());
    assert!(get_content(worker.pool(), &b.id).await.unwrap().is_some());
    assert_eq!(worker.index().search("intelligence", 10).await.unwrap().len(), 2);
}
