use std::env;
use std::path::PathBuf;

use crate::pipeline::config::APP_DIR_NAME;

fn fallback_dotenv_path(rtagg_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    let base = rtagg_home.or(home_dir)?;
    Some(base.join(APP_DIR_NAME).join(".env"))
}

/// Loads `./.env`, or else the `.env` in the app home. Variables already set
/// in the process are never replaced.
pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("RTAGG_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::fallback_dotenv_path;
    use std::path::PathBuf;

    #[test]
    fn fallback_prefers_rtagg_home() {
        let got = fallback_dotenv_path(
            Some(PathBuf::from("/srv")),
            Some(PathBuf::from("/home/ops")),
        );
        let want = Some(PathBuf::from("/srv/realtime-aggregator/.env"));
        assert_eq!(got, want);
    }

    #[test]
    fn fallback_uses_home_when_rtagg_home_unset() {
        let got = fallback_dotenv_path(None, Some(PathBuf::from("/home/ops")));
        let want = Some(PathBuf::from("/home/ops/realtime-aggregator/.env"));
        assert_eq!(got, want);
    }

    #[test]
    fn no_base_means_no_fallback() {
        assert_eq!(fallback_dotenv_path(None, None), None);
    }
}
