//! A listener exporting a persistent root, driven by remote clients.

use std::sync::Arc;

use orb_rpc::Connection;
use orb_server::{ObjectServer, ServerConfig};
use orb_store::{ObjectDb, StoreConfig};
use orb_types::{ClassBuilder, ClassRegistry, ObjectError, TypeTag, Value};
use tokio::sync::oneshot;

fn registry() -> Arc<ClassRegistry> {
    let registry = Arc::new(ClassRegistry::new());
    registry
        .register(
            ClassBuilder::new("Employee")
                .field("name", TypeTag::Str)
                .field("salary", TypeTag::Float)
                .method("raise!", |this, args, _| {
                    let percent = args.first().cloned().unwrap_or_default().as_float()?;
                    let salary = this.get("salary")?.as_float()?;
                    let raised = Value::Float(salary + salary * percent / 100.0);
                    this.set("salary", raised.clone())?;
                    Ok(raised)
                }),
        )
        .unwrap();
    registry
}

fn employee_db(dir: &tempfile::TempDir) -> ObjectDb {
    let registry = registry();
    let db = ObjectDb::open(StoreConfig::new(dir.path().join("orb.db")), registry.clone()).unwrap();
    let brian = registry
        .instantiate(
            "Employee",
            vec![("name".into(), "brian".into()), ("salary".into(), Value::Int(2))],
        )
        .unwrap();
    db.create(brian).unwrap();
    db
}

fn local_config(dir: &tempfile::TempDir) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        store: StoreConfig::new(dir.path().join("orb.db")),
        ..ServerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_raise_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let db = employee_db(&dir);
    let server = ObjectServer::bind(local_config(&dir), Value::object(db.clone()))
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_until(async {
        let _ = stopped.await;
    }));

    let raised = tokio::task::spawn_blocking(move || {
        let conn = Connection::connect("127.0.0.1", port).unwrap();
        let raised = conn.call("raise!", vec![Value::Int(10)], None).unwrap();
        let name = conn.root().send("name", vec![], None).unwrap();
        conn.close();
        (raised, name)
    })
    .await
    .unwrap();
    assert!((raised.0.as_float().unwrap() - 2.2).abs() < 1e-9);
    assert_eq!(raised.1, Value::Str("brian".into()));

    let _ = stop.send(());
    serving.await.unwrap().unwrap();

    let salary = db
        .transaction(true, |root| Ok(root.send("salary", vec![], None)?.as_float()?))
        .unwrap();
    assert!((salary - 2.2).abs() < 1e-9, "salary was {salary}");
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_are_served_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let db = employee_db(&dir);
    let server = ObjectServer::bind(local_config(&dir), Value::object(db.clone()))
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_until(async {
        let _ = stopped.await;
    }));

    let clients: Vec<_> = (0..4)
        .map(|_| {
            tokio::task::spawn_blocking(move || {
                let conn = Connection::connect("127.0.0.1", port).unwrap();
                for _ in 0..5 {
                    conn.call("raise!", vec![Value::Int(0)], None).unwrap();
                }
                conn.close();
            })
        })
        .collect();
    for client in clients {
        client.await.unwrap();
    }

    let _ = stop.send(());
    serving.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn application_errors_reach_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let db = employee_db(&dir);
    let server = ObjectServer::bind(local_config(&dir), Value::object(db))
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_until(async {
        let _ = stopped.await;
    }));

    let err = tokio::task::spawn_blocking(move || {
        let conn = Connection::connect("127.0.0.1", port).unwrap();
        let err = conn.call("fire!", vec![], None).unwrap_err();
        assert!(conn.is_alive());
        conn.close();
        err
    })
    .await
    .unwrap();
    match err {
        ObjectError::RemoteApplication(remote) => assert_eq!(remote.class, "NoMethodError"),
        other => panic!("unexpected {other:?}"),
    }

    let _ = stop.send(());
    serving.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_open_connections() {
    let dir = tempfile::tempdir().unwrap();
    let server = ObjectServer::bind(local_config(&dir), Value::Int(7))
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_until(async {
        let _ = stopped.await;
    }));

    let conn = tokio::task::spawn_blocking(move || {
        let conn = Connection::connect("127.0.0.1", port).unwrap();
        assert_eq!(conn.call("to_s", vec![], None).unwrap(), Value::Str("7".into()));
        conn
    })
    .await
    .unwrap();

    let _ = stop.send(());
    serving.await.unwrap().unwrap();

    let conn = tokio::task::spawn_blocking(move || {
        conn.join();
        conn
    })
    .await
    .unwrap();
    assert!(!conn.is_alive());
}
