use std::path::PathBuf;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{header, Method, Request, Response, StatusCode};
use liveprof::liveprof_capture::{
    decode_pprof_gz, proto, FakeCall, FakeCapability, ProfileKind, RawProfile, SupportedKinds,
};
use liveprof::{EndpointRouter, SessionController, StageRoot, WorkerPool};

struct Fixture {
    router: EndpointRouter,
    fake: Arc<FakeCapability>,
    // Keeps the stage directory alive.
    stage_dir: tempfile::TempDir,
}

fn fixture(supported: SupportedKinds) -> Fixture {
    let fake = Arc::new(FakeCapability::new(supported));
    let controller = SessionController::new(fake.clone(), WorkerPool::new(2));
    let stage_dir = tempfile::tempdir().unwrap();
    let stage = StageRoot::new(Some(stage_dir.path())).unwrap();
    Fixture {
        router: EndpointRouter::new(Arc::new(controller), stage),
        fake,
        stage_dir,
    }
}

impl Fixture {
    async fn get(&self, uri: &str) -> (StatusCode, Response<Full<Bytes>>, Bytes) {
        self.request(Method::GET, uri, Bytes::new()).await
    }

    async fn post(&self, uri: &str, body: &str) -> (StatusCode, Response<Full<Bytes>>, Bytes) {
        self.request(Method::POST, uri, Bytes::from(body.to_string()))
            .await
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Bytes,
    ) -> (StatusCode, Response<Full<Bytes>>, Bytes) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body))
            .unwrap();
        let response = self.router.handle(req).await;
        let status = response.status();
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        (status, Response::from_parts(parts, Full::new(bytes.clone())), bytes)
    }
}

fn text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn function_names(profile: &proto::Profile) -> Vec<String> {
    let mut names: Vec<String> = profile
        .function
        .iter()
        .map(|f| profile.string_table[f.name as usize].clone())
        .collect();
    names.sort();
    names
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inline_cpu_profile() {
    let fx = fixture(SupportedKinds::all());
    let (status, response, body) = fx.get("/profile?duration=0.05&delay=0.01").await;
    assert_eq!(status, StatusCode::OK, "{}", text(&body));
    assert!(body.len() > 100, "only {} bytes", body.len());
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"cpu_profile-duration=0.05&delay=0.01&n=100000000.pb.gz\""
    );
    let profile = decode_pprof_gz(&body).unwrap();
    assert!(function_names(&profile).contains(&"cpu_root".to_string()));
    assert_eq!(profile.period, 10_000_000);
}

#[tokio::test]
async fn raw_format_on_request() {
    let fx = fixture(SupportedKinds::all());
    let (status, response, body) = fx.get("/profile?duration=0.05&pprof=false").await;
    assert_eq!(status, StatusCode::OK);
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.ends_with(".json\""), "{disposition}");
    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(doc["samples"].as_array().unwrap().len(), 8);
}

#[tokio::test]
async fn stop_twice_returns_the_same_samples() {
    let fx = fixture(SupportedKinds::all());
    let (status, _, body) = fx.get("/profile_start?delay=0.005").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), "CPU profiling started.");

    let (status, response, first) = fx.get("/profile_stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"cpu_profile.pb.gz\""
    );
    let (status, _, second) = fx.get("/profile_stop").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!second.is_empty());

    let first = decode_pprof_gz(&first).unwrap();
    let second = decode_pprof_gz(&second).unwrap();
    assert!(!first.sample.is_empty());
    assert_eq!(first.sample, second.sample);
    assert_eq!(first.string_table, second.string_table);
}

#[tokio::test]
async fn allocation_start_and_stop() {
    let fx = fixture(SupportedKinds::all());
    let (status, _, body) = fx.get("/allocs_profile_start?sample_rate=0.01").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), "Allocation profiling started.");

    // The pprof flag only applies to the CPU routes.
    let (status, response, body) = fx.get("/allocs_profile_stop?pprof=false").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"allocs_profile.pb.gz\""
    );
    let profile = decode_pprof_gz(&body).unwrap();
    assert!(function_names(&profile).contains(&"allocations_root".to_string()));
    assert_eq!(profile.period, 100);
}

#[tokio::test]
async fn missing_parameters_list_every_parameter() {
    let fx = fixture(SupportedKinds::all());
    let cases: [(&str, &[&str]); 3] = [
        ("/profile", &["n", "delay", "duration", "pprof"]),
        ("/wall_profile", &["n", "delay", "duration", "pprof"]),
        ("/allocs_profile", &["sample_rate", "duration"]),
    ];
    for (path, names) in cases {
        let (status, _, body) = fx.get(path).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
        let body = text(&body);
        for name in names {
            assert!(body.contains(&format!("  {name}: ")), "{path}: {name} missing from {body}");
        }
        assert!(body.contains(&format!("Example: GET {path}?")), "{body}");
    }
    assert!(fx.fake.calls().is_empty());
}

#[tokio::test]
async fn invalid_parameters_leave_the_capability_alone() {
    let fx = fixture(SupportedKinds::all());
    for uri in [
        "/profile?delay=-1",
        "/profile?n=0",
        "/profile_start?delay=abc",
        "/profile_stop?pprof=maybe",
        "/allocs_profile?sample_rate=2",
        "/allocs_profile_start?sample_rate=0",
        "/heap_snapshot?all_one=yes",
    ] {
        let (status, _, body) = fx.get(uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(text(&body).contains("Example: "), "{uri}: {}", text(&body));
    }
    assert!(fx.fake.calls().is_empty());
}

#[tokio::test]
async fn unsupported_kinds_answer_501_on_every_route() {
    let fx = fixture(SupportedKinds::none().with(ProfileKind::Cpu));
    for uri in [
        "/allocs_profile",
        "/allocs_profile?sample_rate=0.01&duration=0.05",
        "/allocs_profile?sample_rate=not-a-number",
        "/allocs_profile_start",
        "/allocs_profile_stop",
        "/wall_profile",
        "/wall_profile_start",
        "/heap_snapshot",
        "/task_backtraces",
    ] {
        let (status, _, body) = fx.get(uri).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED, "{uri}: {}", text(&body));
        assert!(text(&body).contains("not supported"));
    }
    for profile_type in [
        "allocs_profile",
        "allocs_profile_start",
        "allocs_profile_stop",
        "wall_profile",
        "heap_snapshot",
        "task_backtraces",
    ] {
        let body = format!(r#"{{"profile_type":"{profile_type}"}}"#);
        let (status, _, _) = fx.post("/debug_engine", &body).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED, "{profile_type}");
    }
    assert!(fx.fake.calls().is_empty());

    let (status, _, _) = fx.get("/profile?duration=0.05").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn debug_engine_writes_into_the_stage_directory() {
    let fx = fixture(SupportedKinds::all());
    std::fs::create_dir(fx.stage_dir.path().join("incident")).unwrap();

    let (status, response, body) = fx
        .post(
            "/debug_engine?subdir=incident",
            r#"{"profile_type":"cpu_profile","duration":0.05,"delay":"0.01"}"#,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", text(&body));
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    let path = PathBuf::from(text(&body));
    assert!(path.is_absolute());
    assert_eq!(
        path.parent().unwrap(),
        fx.stage_dir.path().canonicalize().unwrap().join("incident")
    );
    let file_name = path.file_name().unwrap().to_str().unwrap();
    assert!(file_name.starts_with("cpu_profile-duration=0.05&delay=0.01&n=100000000-"));
    assert!(file_name.ends_with(".pb.gz"));
    let from_file = decode_pprof_gz(&std::fs::read(&path).unwrap()).unwrap();

    let (_, _, inline) = fx.get("/profile?duration=0.05&delay=0.01").await;
    let inline = decode_pprof_gz(&inline).unwrap();
    assert_eq!(from_file.sample, inline.sample);
    assert_eq!(from_file.function, inline.function);
    assert_eq!(from_file.string_table, inline.string_table);
}

impl Fixture {
    /// Runs `profile_type` through `debug_engine` and returns the written
    /// file's contents.
    async fn staged(&self, body: &str) -> Vec<u8> {
        let (status, _, path) = self.post("/debug_engine", body).await;
        assert_eq!(status, StatusCode::OK, "{}", text(&path));
        std::fs::read(text(&path)).unwrap()
    }
}

#[tokio::test]
async fn allocation_profiles_match_in_both_delivery_modes() {
    let fx = fixture(SupportedKinds::all());
    let from_file = fx
        .staged(r#"{"profile_type":"allocs_profile","duration":0.05,"sample_rate":0.01}"#)
        .await;
    let (status, _, inline) = fx.get("/allocs_profile?duration=0.05&sample_rate=0.01").await;
    assert_eq!(status, StatusCode::OK);

    let from_file = decode_pprof_gz(&from_file).unwrap();
    let inline = decode_pprof_gz(&inline).unwrap();
    assert!(!inline.sample.is_empty());
    assert_eq!(from_file.period, inline.period);
    assert_eq!(from_file.sample, inline.sample);
    assert_eq!(from_file.function, inline.function);
    assert_eq!(from_file.string_table, inline.string_table);
}

#[tokio::test]
async fn raw_profiles_match_in_both_delivery_modes() {
    let fx = fixture(SupportedKinds::all());
    let from_file = fx
        .staged(r#"{"profile_type":"cpu_profile","duration":0.05,"pprof":false}"#)
        .await;
    let (status, _, inline) = fx.get("/profile?duration=0.05&pprof=false").await;
    assert_eq!(status, StatusCode::OK);

    let from_file = RawProfile::from_json(&from_file).unwrap();
    let inline = RawProfile::from_json(&inline).unwrap();
    assert!(!inline.is_empty());
    assert_eq!(from_file.period, inline.period);
    assert_eq!(from_file.samples, inline.samples);
    assert_eq!(from_file.frames, inline.frames);

    // Stopping a running session goes through the same writer.
    fx.get("/profile_start?delay=0.01").await;
    let (status, _, inline) = fx.get("/profile_stop?pprof=false").await;
    assert_eq!(status, StatusCode::OK);
    let from_file = fx
        .staged(r#"{"profile_type":"cpu_profile_stop","pprof":false}"#)
        .await;
    let from_file = RawProfile::from_json(&from_file).unwrap();
    let inline = RawProfile::from_json(&inline).unwrap();
    assert_eq!(from_file.samples, inline.samples);
    assert_eq!(from_file.frames, inline.frames);
}

#[tokio::test]
async fn debug_engine_start_and_one_shots() {
    let fx = fixture(SupportedKinds::all());
    let (status, _, body) = fx
        .post("/debug_engine", r#"{"profile_type":"allocs_profile_start","sample_rate":0.5}"#)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), "Allocation profiling started.");

    let (status, _, body) = fx
        .post("/debug_engine", r#"{"profile_type":"heap_snapshot","all_one":true}"#)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", text(&body));
    let path = PathBuf::from(text(&body));
    assert!(path
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("heap_snapshot-all_one=true-"));
    let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert!(doc["nodes"].as_array().is_some_and(|nodes| !nodes.is_empty()));
    // Only the assembled snapshot is left behind.
    let entries: Vec<_> = std::fs::read_dir(fx.stage_dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);

    let (status, _, body) = fx
        .post("/debug_engine", r#"{"profile_type":"task_backtraces"}"#)
        .await;
    assert_eq!(status, StatusCode::OK);
    let report = std::fs::read_to_string(text(&body)).unwrap();
    assert!(report.contains("fake-worker-1"));

    assert!(fx.fake.calls().contains(&FakeCall::TaskBacktraces));
}

#[tokio::test]
async fn debug_engine_missing_subdirectory() {
    let fx = fixture(SupportedKinds::all());
    let (status, _, body) = fx
        .post("/debug_engine?subdir=nope", r#"{"profile_type":"cpu_profile"}"#)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text(&body).trim(), "Subdirectory does not exist: nope");
    assert!(!fx.stage_dir.path().join("nope").exists());

    let (status, _, _) = fx
        .post("/debug_engine?subdir=../outside", r#"{"profile_type":"cpu_profile"}"#)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(fx.fake.calls().is_empty());
}

#[tokio::test]
async fn debug_engine_rejects_bad_requests() {
    let fx = fixture(SupportedKinds::all());
    let (status, _, body) = fx
        .post("/debug_engine", r#"{"profile_type":"gpu_profile"}"#)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text(&body).trim(), "Unknown profile_type: gpu_profile");

    for body in ["", "not json", "[1, 2]", r#"{"duration": 3}"#] {
        let (status, _, _) = fx.post("/debug_engine", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body:?}");
    }

    let (status, _, _) = fx
        .post("/debug_engine", r#"{"profile_type":"cpu_profile","n":[1]}"#)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(fx.fake.calls().is_empty());
}

#[tokio::test]
async fn routing_misses() {
    let fx = fixture(SupportedKinds::all());
    let (status, _, _) = fx.get("/gpu_profile").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, response, _) = fx.post("/profile", "").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers()[header::ALLOW], "GET");

    let (status, response, _) = fx.get("/debug_engine").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers()[header::ALLOW], "POST");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_kinds_use_their_own_buffers() {
    let fx = fixture(SupportedKinds::all());
    let (cpu, allocs) = tokio::join!(
        fx.get("/profile?duration=0.1&delay=0.01"),
        fx.get("/allocs_profile?duration=0.1&sample_rate=0.001"),
    );
    assert_eq!(cpu.0, StatusCode::OK);
    assert_eq!(allocs.0, StatusCode::OK);

    let cpu = function_names(&decode_pprof_gz(&cpu.2).unwrap());
    let allocs = function_names(&decode_pprof_gz(&allocs.2).unwrap());
    assert!(!cpu.is_empty());
    assert!(!allocs.is_empty());
    assert!(cpu.iter().all(|name| name.starts_with("cpu_")), "{cpu:?}");
    assert!(allocs.iter().all(|name| name.starts_with("allocations_")), "{allocs:?}");
}

#[tokio::test]
async fn serves_over_tcp() {
    use hyper_util::rt::TokioIo;

    let fx = fixture(SupportedKinds::all());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(liveprof::serve_until(
        listener,
        Arc::new(fx.router),
        async move {
            let _ = shutdown_rx.await;
        },
    ));

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let req = Request::builder()
        .uri("/profile_start")
        .header(header::HOST, addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(text(&body), "CPU profiling started.");

    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
