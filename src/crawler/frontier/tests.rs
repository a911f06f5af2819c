use super::*;

fn frontier(max_depth: u32) -> Frontier {
    Frontier::new(max_depth, &["Blocked.COM".to_string()])
}

#[test]
fn push_rejects_unwanted_urls() {
    let frontier = frontier(2);

    assert_eq!(frontier.push(CrawlTask::new("", 0)), Err(Rejection::Empty));
    assert_eq!(
        frontier.push(CrawlTask::new("https://example.com/page#intro", 1)),
        Err(Rejection::Fragment)
    );
    assert_eq!(
        frontier.push(CrawlTask::new("https://www.blocked.com/a", 1)),
        Err(Rejection::Blocked)
    );
    assert_eq!(
        frontier.push(CrawlTask::new("https://example.com/deep", 3)),
        Err(Rejection::TooDeep)
    );
    assert_eq!(frontier.queued_count(), 0);
}

#[test]
fn blocklist_is_a_case_insensitive_substring_match() {
    let frontier = frontier(2);

    assert!(frontier.is_blocked("HTTPS://BLOCKED.COM/"));
    // Matches anywhere in the url, including the query string
    assert!(frontier.is_blocked("https://safe.com/page?ref=blocked.com"));
    assert!(!frontier.is_blocked("https://example.com/"));
    assert!(!Frontier::new(2, &[]).is_blocked("https://blocked.com/"));
}

#[test]
fn url_is_queued_at_most_once() {
    let frontier = frontier(2);

    assert_eq!(
        frontier.push(CrawlTask::new("https://example.com/a", 1)),
        Ok(())
    );
    assert_eq!(
        frontier.push(CrawlTask::new("https://example.com/a", 2)),
        Err(Rejection::AlreadyQueued)
    );
    assert_eq!(frontier.queued_count(), 1);
}

#[tokio::test]
async fn visited_urls_are_not_requeued() {
    let frontier = frontier(2);
    frontier
        .push(CrawlTask::new("https://example.com/", 0))
        .expect("seed should be accepted");

    let task = frontier.next().await.expect("seed should be dequeued");
    assert_eq!(task.url, "https://example.com/");
    assert_eq!(frontier.visited_count(), 1);

    assert_eq!(
        frontier.push(CrawlTask::new("https://example.com/", 1)),
        Err(Rejection::Visited)
    );
    frontier.complete();
    assert_eq!(frontier.next().await, None);
}

#[tokio::test]
async fn tasks_are_dequeued_in_fifo_order() {
    let frontier = frontier(2);
    for path in ["a", "b", "c"] {
        frontier
            .push(CrawlTask::new(format!("https://example.com/{}", path), 1))
            .expect("task should be accepted");
    }

    let mut order = Vec::new();
    while let Some(task) = frontier.next().await {
        order.push(task.url);
        frontier.complete();
    }
    assert_eq!(
        order,
        vec![
            "https://example.com/a",
            "https://example.com/b",
            "https://example.com/c"
        ]
    );
    assert_eq!(frontier.visited_count(), 3);
}

#[tokio::test]
async fn idle_worker_waits_for_links_from_in_flight_task() {
    let frontier = frontier(2);
    frontier
        .push(CrawlTask::new("https://example.com/", 0))
        .expect("seed should be accepted");
    let _seed = frontier.next().await.expect("seed should be dequeued");

    let (next, ()) = tokio::join!(frontier.next(), async {
        tokio::task::yield_now().await;
        frontier
            .push(CrawlTask::new("https://example.com/child", 1))
            .expect("link should be accepted");
        frontier.complete();
    });

    assert_eq!(next, Some(CrawlTask::new("https://example.com/child", 1)));
}

#[tokio::test]
async fn idle_worker_observes_drain() {
    let frontier = frontier(2);
    frontier
        .push(CrawlTask::new("https://example.com/", 0))
        .expect("seed should be accepted");
    let _seed = frontier.next().await.expect("seed should be dequeued");

    let (next, ()) = tokio::join!(frontier.next(), async {
        tokio::task::yield_now().await;
        frontier.complete();
    });

    assert_eq!(next, None);
}

#[tokio::test]
async fn close_stops_dequeues() {
    let frontier = frontier(2);
    frontier
        .push(CrawlTask::new("https://example.com/a", 0))
        .expect("task should be accepted");

    frontier.close();
    assert!(frontier.is_closed());
    assert_eq!(frontier.next().await, None);
    assert_eq!(frontier.visited_count(), 0);
}
