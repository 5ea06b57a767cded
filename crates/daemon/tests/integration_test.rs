use portalloc_common::{
    AllocateRequest, AllocationError, AvailabilityResponse, BatchAllocateRequest, PortAllocation, PortBinding,
    Protocol, RangeResponse, ReleaseOwnerRequest, ReleaseRequest,
};
use portalloc_daemon::{router, AppState, MemoryAllocator, SqliteAllocator};
use reqwest::{Client, StatusCode};
use std::sync::Arc;

/// Serve the API on an ephemeral port and return its base URL.
async fn spawn_daemon(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn sqlite_daemon() -> String {
    spawn_daemon(AppState::new(Arc::new(SqliteAllocator::open_in_memory().unwrap()))).await
}

fn alloc_req(server_id: i64, port: i64, protocol: &str, owner_id: i64) -> AllocateRequest {
    AllocateRequest {
        server_id,
        port,
        protocol: protocol.to_string(),
        owner_id,
    }
}

#[tokio::test]
async fn test_full_lifecycle() {
    let base_url = sqlite_daemon().await;
    let client = Client::new();

    // 1. Allocate
    let resp = client
        .post(format!("{}/alloc", base_url))
        .json(&alloc_req(1, 27015, "TCP", 100))
        .send()
        .await
        .expect("Failed to send alloc request");
    assert_eq!(resp.status(), StatusCode::CREATED);
    let allocation: PortAllocation = resp.json().await.unwrap();
    assert_eq!(allocation.port, 27015);
    assert_eq!(allocation.protocol, Protocol::Tcp);
    assert_eq!(allocation.owner_id, 100);

    // 2. Verify list and lookup
    let listed: Vec<PortAllocation> = client
        .get(format!("{}/list", base_url))
        .query(&[("server_id", 1)])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed, vec![allocation.clone()]);

    let fetched: PortAllocation = client
        .get(format!("{}/allocation", base_url))
        .query(&[("server_id", "1"), ("port", "27015"), ("protocol", "TCP")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched, allocation);

    // 3. Release, twice
    for _ in 0..2 {
        let resp = client
            .post(format!("{}/release", base_url))
            .json(&ReleaseRequest {
                server_id: 1,
                port: 27015,
                protocol: "TCP".to_string(),
            })
            .send()
            .await
            .expect("Failed to release");
        assert!(resp.status().is_success());
    }

    let availability: AvailabilityResponse = client
        .get(format!("{}/available", base_url))
        .query(&[("server_id", "1"), ("port", "27015"), ("protocol", "TCP")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(availability.available);
}

#[tokio::test]
async fn test_error_statuses_carry_detail() {
    let base_url = sqlite_daemon().await;
    let client = Client::new();

    let resp = client
        .post(format!("{}/alloc", base_url))
        .json(&alloc_req(1, 70000, "TCP", 100))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let err: AllocationError = resp.json().await.unwrap();
    assert_eq!(err, AllocationError::InvalidPort { port: 70000 });

    client
        .post(format!("{}/alloc", base_url))
        .json(&alloc_req(1, 8080, "UDP", 100))
        .send()
        .await
        .unwrap();
    let resp = client
        .post(format!("{}/alloc", base_url))
        .json(&alloc_req(1, 8080, "UDP", 200))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let err: AllocationError = resp.json().await.unwrap();
    assert_eq!(
        err,
        AllocationError::PortConflict {
            server_id: 1,
            port: 8080,
            protocol: Protocol::Udp,
            existing_owner: 100,
            requested_owner: 200,
        }
    );

    let resp = client
        .get(format!("{}/allocation", base_url))
        .query(&[("server_id", "1"), ("port", "8080"), ("protocol", "TCP")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let err: AllocationError = resp.json().await.unwrap();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_batch_and_owner_release() {
    let base_url = spawn_daemon(AppState::new(Arc::new(MemoryAllocator::new()))).await;
    let client = Client::new();

    client
        .post(format!("{}/alloc", base_url))
        .json(&alloc_req(1, 8080, "TCP", 999))
        .send()
        .await
        .unwrap();

    let mut request = BatchAllocateRequest {
        server_id: 1,
        bindings: vec![
            PortBinding::new(25565, "TCP"),
            PortBinding::new(25565, "UDP"),
            PortBinding::new(8080, "TCP"),
        ],
        owner_id: 100,
    };
    let resp = client
        .post(format!("{}/alloc/batch", base_url))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let owned: Vec<PortAllocation> = client
        .get(format!("{}/owner", base_url))
        .query(&[("owner_id", 100)])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(owned.is_empty());

    request.bindings.pop();
    let resp = client
        .post(format!("{}/alloc/batch", base_url))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Vec<PortAllocation> = resp.json().await.unwrap();
    assert_eq!(created.len(), 2);

    let resp = client
        .post(format!("{}/release/owner", base_url))
        .json(&ReleaseOwnerRequest { owner_id: 100 })
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let remaining: Vec<PortAllocation> = client
        .get(format!("{}/list", base_url))
        .query(&[("server_id", 1)])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].owner_id, 999);
}

#[tokio::test]
async fn test_range_endpoint() {
    let base_url = sqlite_daemon().await;
    let client = Client::new();

    for port in [8080, 8081, 8083] {
        client
            .post(format!("{}/alloc", base_url))
            .json(&alloc_req(1, port, "TCP", 100))
            .send()
            .await
            .unwrap();
    }

    let range: RangeResponse = client
        .get(format!("{}/range", base_url))
        .query(&[
            ("server_id", "1"),
            ("protocol", "TCP"),
            ("start", "8080"),
            ("end", "8090"),
            ("limit", "5"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(range.ports, vec![8082, 8084, 8085, 8086, 8087]);

    let health = client.get(format!("{}/health", base_url)).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "ok");
}
