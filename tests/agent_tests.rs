//! Agent 端到端测试
//!
//! 在临时数据目录里启动真实的 Agent（Unix socket + JSONL），
//! 用 AgentClient / Reconciler / RecipientListener 驱动完整链路。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use orchd_db::*;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

fn agent_config(tmp: &TempDir) -> AgentConfig {
    AgentConfig {
        data_dir: tmp.path().to_path_buf(),
    }
}

fn client_config(tmp: &TempDir, component: &str) -> ClientConfig {
    let mut config = ClientConfig::new(component);
    config.data_dir = tmp.path().to_path_buf();
    config.connect_retries = 20;
    config.retry_interval_ms = 50;
    config
}

/// 测试用的快节奏同步参数
fn fast_sync() -> SyncConfig {
    SyncConfig {
        backoff_initial: Duration::from_millis(50),
        backoff_max: Duration::from_millis(500),
        keepalive_interval: Duration::from_millis(200),
    }
}

/// 启动 Agent 并等 socket 就绪
async fn start_agent(config: AgentConfig) -> (Arc<Agent>, tokio::task::JoinHandle<()>) {
    let socket_path = config.socket_path();
    let agent = Arc::new(Agent::new(config).unwrap());
    let run = agent.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = run.run().await {
            eprintln!("agent exited with error: {}", e);
        }
    });

    assert!(
        wait_until(|| socket_path.exists(), 5000).await,
        "agent socket 未就绪"
    );
    (agent, handle)
}

/// 轮询等待条件成立
async fn wait_until<F: Fn() -> bool>(cond: F, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}

/// 等待文件内容满足条件
async fn wait_for_file_content(path: &Path, needle: &str, timeout_ms: u64) -> bool {
    let path = path.to_path_buf();
    let needle = needle.to_string();
    wait_until(
        move || {
            std::fs::read_to_string(&path)
                .map(|s| s.contains(&needle))
                .unwrap_or(false)
        },
        timeout_ms,
    )
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_submit_push_and_delivery_walk() {
    let tmp = TempDir::new().unwrap();
    let (agent, handle) = start_agent(agent_config(&tmp)).await;

    // 订阅者先就位
    let mut subscriber = connect(client_config(&tmp, "subscriber")).await.unwrap();
    subscriber
        .subscribe(vec![EventType::NewMessage])
        .await
        .unwrap();

    // 写入方提交消息
    let mut writer = connect(client_config(&tmp, "writer")).await.unwrap();
    let id = writer
        .submit_message("mcp", "do the thing", vec!["newhart".to_string()], None)
        .await
        .unwrap();
    assert!(id > 0);

    // 订阅者收到推送，载荷带路由信息
    let push = timeout(Duration::from_secs(5), subscriber.recv_push())
        .await
        .expect("等推送超时")
        .expect("推送通道关闭");
    match push {
        Push::MessageSubmitted {
            message_id,
            sender,
            recipients,
        } => {
            assert_eq!(message_id, id);
            assert_eq!(sender, "mcp");
            assert_eq!(recipients, vec!["newhart"]);
        }
        other => panic!("unexpected push: {:?}", other),
    }

    // 通过线上协议走完整个投递生命周期
    writer.mark_received(id, "newhart").await.unwrap();
    writer.mark_routed(id, "newhart").await.unwrap();
    writer.mark_responded(id, "newhart").await.unwrap();

    // 独立读句柄验证落库状态
    let read_db = OrchDb::connect(DbConfig::local(tmp.path().join("db").join("orchd.db"))).unwrap();
    let delivery = read_db.get_delivery(id, "newhart").unwrap().unwrap();
    assert_eq!(delivery.state, DeliveryState::Responded);

    // 非法迁移通过线上协议返回 409
    let err = writer.mark_routed(id, "newhart").await.unwrap_err();
    assert!(err.to_string().contains("409"), "err: {}", err);

    agent.request_shutdown();
    let _ = handle.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconciler_live_rebuild() {
    let tmp = TempDir::new().unwrap();
    let (agent, handle) = start_agent(agent_config(&tmp)).await;

    let target = tmp.path().join("agents.json");
    let read_db = Arc::new(
        OrchDb::connect(DbConfig::local(tmp.path().join("db").join("orchd.db"))).unwrap(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        read_db,
        client_config(&tmp, "reconciler"),
        fast_sync(),
        target.clone(),
        ReloadSignal::Disabled,
        shutdown_rx,
    );
    let sync_handle = tokio::spawn(reconciler.run());

    // 启动即做一轮无条件重建: 空库也会发布出一份文档
    assert!(wait_until(|| target.exists(), 5000).await, "初始发布未出现");

    // 配置写入触发事件驱动的重建
    let mut writer = connect(client_config(&tmp, "writer")).await.unwrap();
    writer
        .upsert_agent_config(AgentConfigInput {
            name: "coder".to_string(),
            model: "m1".to_string(),
            fallback_models: Some(vec!["m2".to_string()]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(
        wait_for_file_content(&target, "\"m1\"", 5000).await,
        "配置变更未反映到文档"
    );

    // 系统默认值越界 -> 文档里是收敛后的值
    writer
        .set_system_default("max_spawn_depth", "9", ValueType::Integer)
        .await
        .unwrap();
    assert!(
        wait_for_file_content(&target, "\"max_spawn_depth\": 5", 5000).await,
        "越界默认值未收敛"
    );

    let _ = shutdown_tx.send(true);
    let _ = sync_handle.await;
    agent.request_shutdown();
    let _ = handle.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconciler_reconnect_catch_up() {
    let tmp = TempDir::new().unwrap();
    let (agent1, handle1) = start_agent(agent_config(&tmp)).await;

    let db_path = tmp.path().join("db").join("orchd.db");
    let target = tmp.path().join("agents.json");
    let read_db = Arc::new(OrchDb::connect(DbConfig::local(&db_path)).unwrap());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        read_db,
        client_config(&tmp, "reconciler"),
        fast_sync(),
        target.clone(),
        ReloadSignal::Disabled,
        shutdown_rx,
    );
    let sync_handle = tokio::spawn(reconciler.run());
    assert!(wait_until(|| target.exists(), 5000).await);

    // agent 下线，reconciler 进入断线重连
    agent1.request_shutdown();
    let _ = handle1.await;
    drop(agent1);

    // 断线期间发生一次够格的写入 —— 没有任何事件发出
    let writer_db = OrchDb::connect(DbConfig::local(&db_path)).unwrap();
    writer_db
        .upsert_agent_config(&AgentConfigInput {
            name: "scout".to_string(),
            model: "m3".to_string(),
            ..Default::default()
        })
        .unwrap();
    drop(writer_db);

    // agent 重新上线: 重连成功必做的补偿重建要把这次写入带出来
    let (agent2, handle2) = start_agent(agent_config(&tmp)).await;
    assert!(
        wait_for_file_content(&target, "\"m3\"", 10_000).await,
        "重连补偿重建未覆盖断线期间的写入"
    );

    let _ = shutdown_tx.send(true);
    let _ = sync_handle.await;
    agent2.request_shutdown();
    let _ = handle2.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recipient_listener_poll_and_push() {
    let tmp = TempDir::new().unwrap();
    let (agent, handle) = start_agent(agent_config(&tmp)).await;

    // 监听器启动前就有一条在途消息: 初始拉取要能补上
    let mut writer = connect(client_config(&tmp, "writer")).await.unwrap();
    let first = writer
        .submit_message("mcp", "early bird", vec!["newhart".to_string()], None)
        .await
        .unwrap();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = RecipientListener::new(
        client_config(&tmp, "newhart-listener"),
        "newhart",
        0,
        fast_sync(),
        shutdown_rx,
        Box::new(move |message| {
            let _ = msg_tx.send(message);
        }),
    );
    let listener_handle = tokio::spawn(listener.run());

    let got = timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("等初始拉取超时")
        .expect("回调通道关闭");
    assert_eq!(got.id, first);
    assert_eq!(got.body, "early bird");

    // 推送路径: 新消息到达后被拉取并置 received
    let second = writer
        .submit_message("mcp", "fresh one", vec!["newhart".to_string()], None)
        .await
        .unwrap();
    let got = timeout(Duration::from_secs(5), msg_rx.recv())
        .await
        .expect("等推送驱动的拉取超时")
        .expect("回调通道关闭");
    assert_eq!(got.id, second);

    // 两条都已置 received
    let read_db = OrchDb::connect(DbConfig::local(tmp.path().join("db").join("orchd.db"))).unwrap();
    for id in [first, second] {
        let delivery = read_db.get_delivery(id, "newhart").unwrap().unwrap();
        assert_eq!(delivery.state, DeliveryState::Received);
    }

    // 发给别人的消息不会进回调
    writer
        .submit_message("mcp", "not yours", vec!["coder".to_string()], None)
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(msg_rx.try_recv().is_err());

    let _ = shutdown_tx.send(true);
    let _ = listener_handle.await;
    agent.request_shutdown();
    let _ = handle.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_flow_over_wire() {
    let tmp = TempDir::new().unwrap();
    let (agent, handle) = start_agent(agent_config(&tmp)).await;

    let mut subscriber = connect(client_config(&tmp, "subscriber")).await.unwrap();
    subscriber
        .subscribe(vec![EventType::JobChanged, EventType::NewMessage])
        .await
        .unwrap();

    let mut owner = connect(client_config(&tmp, "newhart")).await.unwrap();
    let job_id = owner
        .create_job(
            "newhart",
            Some("mcp".to_string()),
            None,
            8,
            vec!["mcp".to_string()],
            None,
        )
        .await
        .unwrap();

    // 待办列表走线上协议
    let pending = owner.list_pending_jobs("newhart").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, job_id);
    assert_eq!(pending[0].priority, 8);

    owner
        .transition_job(job_id, JobStatus::InProgress, "newhart")
        .await
        .unwrap();
    // InProgress 的 JobChanged 推送
    let push = timeout(Duration::from_secs(5), subscriber.recv_push())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        push,
        Push::JobChanged {
            status: JobStatus::InProgress,
            ..
        }
    ));

    owner
        .complete_job(job_id, "newhart", None, Some("all done".to_string()))
        .await
        .unwrap();

    // 完成会先后推 JobChanged(Completed) 和完成通知的 MessageSubmitted
    let push = timeout(Duration::from_secs(5), subscriber.recv_push())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        push,
        Push::JobChanged {
            status: JobStatus::Completed,
            ..
        }
    ));
    let push = timeout(Duration::from_secs(5), subscriber.recv_push())
        .await
        .unwrap()
        .unwrap();
    match push {
        Push::MessageSubmitted { recipients, .. } => assert_eq!(recipients, vec!["mcp"]),
        other => panic!("unexpected push: {:?}", other),
    }

    // 通知落在 mcp 的收件箱里
    let inbox = owner.list_pending("mcp", 0).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert!(inbox[0].body.contains("all done"));

    // 二次完成: 线上返回 409，通知不重发
    let err = owner.complete_job(job_id, "newhart", None, None).await.unwrap_err();
    assert!(err.to_string().contains("409"), "err: {}", err);
    assert_eq!(owner.list_pending("mcp", 0).await.unwrap().len(), 1);

    agent.request_shutdown();
    let _ = handle.await;
}
