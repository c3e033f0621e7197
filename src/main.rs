//! 感情認識APIサーバー
//!
//! 使い方: `emotion_server [config.json]`

use emotion_lib::model::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = emotion_lib::logging::init() {
        eprintln!("ログ初期化に失敗しました: {}", e);
    }

    let config = AppConfig::from_args();
    config.display();

    if let Err(e) = emotion_lib::server::run(&config).await {
        tracing::error!("サーバーを起動できません: {:#}", e);
        return Err(e);
    }
    Ok(())
}
