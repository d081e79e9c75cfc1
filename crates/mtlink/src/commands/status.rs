//! `mtlink status`: show persisted sessions.

use anyhow::Result;

use mtlink::store::{FileSessionStore, SessionStore};

pub async fn run(config_path: &str, phone: Option<&str>) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let store = FileSessionStore::new(&config.session_home);

    match phone {
        Some(phone) => {
            if store.exists(phone).await {
                println!("{phone}: authenticated ({})", store.session_path(phone).display());
            } else {
                println!("{phone}: no stored session");
            }
        }
        None => {
            let phones = store.list().await?;
            if phones.is_empty() {
                println!("No stored sessions in {}", store.session_home().display());
            }
            for phone in phones {
                println!("{phone}");
            }
        }
    }
    Ok(())
}
