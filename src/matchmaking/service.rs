//! Find-game request validation and response shaping

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;

use super::{FindGameParams, GameManager, ManagerError};

pub const INVALID_REGION: &str = "Invalid Region";
pub const INVALID_MODE: &str = "Invalid game mode index";

/// Body of `POST /api/find_game`. Loosely typed fields fall back to
/// defaults instead of failing the request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindGameBody {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub player_count: Option<Value>,
    #[serde(default)]
    pub auto_fill: Option<Value>,
    #[serde(default)]
    pub game_mode_idx: Option<Value>,
    #[serde(default)]
    pub api_key: String,
}

impl FindGameBody {
    /// Index into the configured modes. Anything but a number selects mode 0;
    /// a number that is not a valid index selects nothing.
    fn mode_index(&self) -> Option<usize> {
        match &self.game_mode_idx {
            Some(Value::Number(n)) => n.as_u64().and_then(|i| usize::try_from(i).ok()),
            _ => Some(0),
        }
    }

    fn auto_fill(&self) -> bool {
        self.auto_fill.as_ref().and_then(Value::as_bool).unwrap_or(true)
    }

    fn player_count(&self, max: u8) -> u8 {
        match self.player_count.as_ref().and_then(Value::as_f64) {
            Some(n) => n.clamp(1.0, max.max(1) as f64) as u8,
            None => 1,
        }
    }

    /// Check the request against this server's region and modes
    pub fn resolve(&self, config: &Config) -> Result<FindGameParams, &'static str> {
        if self.region != config.this_region || config.region().is_none() {
            return Err(INVALID_REGION);
        }

        let mode = self
            .mode_index()
            .and_then(|idx| config.modes.get(idx))
            .filter(|mode| mode.enabled)
            .ok_or(INVALID_MODE)?;

        Ok(FindGameParams {
            map_name: mode.map_name.clone(),
            team_mode: mode.team_mode,
            auto_fill: self.auto_fill(),
            player_count: self.player_count(mode.team_mode.group_size()),
        })
    }
}

/// A seat the client can connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundGame {
    pub zone: String,
    pub game_id: String,
    pub use_https: bool,
    pub hosts: Vec<String>,
    pub addrs: Vec<String>,
    /// Join token
    pub data: String,
    pub route: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FindGameEntry {
    Found(FoundGame),
    Error { err: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FindGameResponse {
    pub res: Vec<FindGameEntry>,
}

impl FindGameResponse {
    pub fn error(err: &str) -> Self {
        Self {
            res: vec![FindGameEntry::Error { err: err.to_string() }],
        }
    }
}

/// Validate a request and place it. Request problems come back as an error
/// entry; only placement failures are errors.
pub async fn find_game(
    config: &Config,
    manager: &dyn GameManager,
    body: &FindGameBody,
) -> Result<FindGameResponse, ManagerError> {
    let params = match body.resolve(config) {
        Ok(params) => params,
        Err(err) => {
            warn!(region = %body.region, error = err, "Rejected find_game request");
            return Ok(FindGameResponse::error(err));
        }
    };
    let Some(region) = config.region() else {
        return Ok(FindGameResponse::error(INVALID_REGION));
    };

    let found = manager.find_game(params.clone()).await?;
    info!(
        match_id = %found.game_id,
        route = %found.route,
        map = %params.map_name,
        player_count = params.player_count,
        "Found game"
    );

    Ok(FindGameResponse {
        res: vec![FindGameEntry::Found(FoundGame {
            zone: String::new(),
            game_id: found.game_id,
            use_https: region.https,
            hosts: vec![region.address.clone()],
            addrs: vec![region.address.clone()],
            data: found.token,
            route: found.route,
        })],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::TeamMode;
    use serde_json::json;

    fn body(value: Value) -> FindGameBody {
        serde_json::from_value(value).unwrap()
    }

    fn local(extra: Value) -> FindGameBody {
        let mut value = json!({ "region": "local" });
        if let (Some(obj), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            obj.extend(extra.clone());
        }
        body(value)
    }

    #[test]
    fn test_region_mismatch() {
        let config = Config::default();
        assert_eq!(body(json!({ "region": "eu" })).resolve(&config), Err(INVALID_REGION));
    }

    #[test]
    fn test_lenient_defaults() {
        let config = Config::default();
        let params = local(json!({ "gameModeIdx": "two", "autoFill": "yes", "playerCount": null }))
            .resolve(&config)
            .unwrap();
        assert_eq!(params.map_name, config.modes[0].map_name);
        assert!(params.auto_fill);
        assert_eq!(params.player_count, 1);
    }

    #[test]
    fn test_player_count_is_clamped_to_team_size() {
        let config = Config::default();
        let idx = config
            .modes
            .iter()
            .position(|m| m.enabled && m.team_mode == TeamMode::Duo)
            .unwrap();
        let params = local(json!({ "gameModeIdx": idx, "playerCount": 9 }))
            .resolve(&config)
            .unwrap();
        assert_eq!(params.player_count, 2);

        let params = local(json!({ "gameModeIdx": idx, "playerCount": -3 }))
            .resolve(&config)
            .unwrap();
        assert_eq!(params.player_count, 1);
    }

    #[test]
    fn test_bad_mode_index() {
        let mut config = Config::default();
        assert_eq!(local(json!({ "gameModeIdx": 99 })).resolve(&config), Err(INVALID_MODE));
        assert_eq!(local(json!({ "gameModeIdx": -1 })).resolve(&config), Err(INVALID_MODE));

        config.modes[0].enabled = false;
        assert_eq!(local(json!({ "gameModeIdx": 0 })).resolve(&config), Err(INVALID_MODE));
    }

    #[test]
    fn test_error_entry_shape() {
        let value = serde_json::to_value(FindGameResponse::error(INVALID_MODE)).unwrap();
        assert_eq!(value, json!({ "res": [{ "err": "Invalid game mode index" }] }));
    }
}
