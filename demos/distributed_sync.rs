// Example: keep Casbin policies in sync across instances with RedisWatcher
//
// Both instances load the same policy file. The enforcer drives the watcher
// itself through `set_watcher`, so a policy change made on instance 1 is
// announced on the channel and instance 2 reloads the file.

use casbin::prelude::*;
use redis_watcher::{default_update_callback, RedisWatcher, WatcherOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const RBAC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
"#;

async fn instance(
    name: &str,
    policy_path: &str,
) -> std::result::Result<Arc<Mutex<Enforcer>>, Box<dyn std::error::Error>> {
    let options = WatcherOptions::default().with_channel("/casbin-policy-updates");
    let mut watcher = RedisWatcher::new("127.0.0.1:6379", options).await?;

    let model = DefaultModel::from_str(RBAC_MODEL).await?;
    let adapter = FileAdapter::new(policy_path.to_string());
    let enforcer = Arc::new(Mutex::new(Enforcer::new(model, adapter).await?));

    let reload = default_update_callback(enforcer.clone());
    let name = name.to_string();
    watcher.set_update_callback(Box::new(move |msg: String| {
        log::info!("[{}] policy update notification: {}", name, msg);
        reload(&msg);
    }));

    enforcer.lock().await.set_watcher(Box::new(watcher));
    Ok(enforcer)
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let policy_path = std::env::temp_dir().join("redis_watcher_distributed_sync.csv");
    std::fs::write(&policy_path, "p, alice, data1, read\n")?;
    let policy_path = policy_path.to_string_lossy().into_owned();

    // Two service instances sharing one policy file
    let enforcer1 = instance("instance-1", &policy_path).await?;
    let enforcer2 = instance("instance-2", &policy_path).await?;

    // Give both subscriptions time to be established
    tokio::time::sleep(Duration::from_millis(200)).await;

    {
        let mut enforcer = enforcer1.lock().await;
        enforcer
            .add_policy(vec![
                "bob".to_string(),
                "data2".to_string(),
                "write".to_string(),
            ])
            .await?;
        // The file adapter only persists on save; both calls notify the channel.
        enforcer.save_policy().await?;
        log::info!("[instance-1] added and saved policy: bob, data2, write");
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    let allowed = enforcer2.lock().await.enforce(("bob", "data2", "write"))?;
    log::info!("[instance-2] bob may write data2: {}", allowed);

    std::fs::remove_file(&policy_path)?;
    Ok(())
}
