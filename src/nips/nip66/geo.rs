//! NIP-66 geolocation check: GeoLite2 City lookup on the relay's
//! resolved address, with a geohash computed from the coordinates.
//! Clearnet relays only.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use maxminddb::geoip2;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::relay::{Network, Relay};
use crate::nips::nip66::resolve_host;
use crate::nips::{Probe, ProbeLogs};

pub type GeoReader = maxminddb::Reader<Vec<u8>>;

/// Open a GeoLite2 database off the async runtime.
pub async fn open_reader(path: &Path) -> Result<Arc<GeoReader>> {
    let path = path.to_path_buf();
    let reader = tokio::task::spawn_blocking(move || GeoReader::open_readfile(path))
        .await
        .map_err(|e| crate::error::BigBrotrError::Other(anyhow::anyhow!(e)))??;
    Ok(Arc::new(reader))
}

pub async fn execute(relay: &Relay, reader: Arc<GeoReader>, geohash_precision: usize) -> Probe {
    tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "geo_testing");

    if relay.network != Network::Clearnet {
        return Probe {
            data: Value::Object(Map::new()),
            logs: ProbeLogs::fail(format!("requires clearnet, got {}", relay.network)),
        };
    }

    let resolved = resolve_host(&relay.host).await;
    let Some(ip) = resolved.preferred() else {
        tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "geo_no_ip");
        return Probe {
            data: Value::Object(Map::new()),
            logs: ProbeLogs::fail("could not resolve hostname to IP"),
        };
    };

    let data = tokio::task::spawn_blocking(move || lookup_city(&reader, ip, geohash_precision))
        .await
        .unwrap_or_default();

    if data.is_empty() {
        tracing::debug!(target: "bigbrotr::nips::nip66", relay = %relay.url, "geo_no_data");
        return Probe {
            data: Value::Object(data),
            logs: ProbeLogs::fail("no geo data found for IP"),
        };
    }

    tracing::debug!(
        target: "bigbrotr::nips::nip66",
        relay = %relay.url,
        country = ?data.get("geo_country"),
        "geo_completed"
    );
    Probe {
        data: Value::Object(data),
        logs: ProbeLogs::ok(),
    }
}

fn lookup_city(reader: &GeoReader, ip: IpAddr, geohash_precision: usize) -> Map<String, Value> {
    let mut result = Map::new();
    let city: geoip2::City<'_> = match reader.lookup(ip) {
        Ok(city) => city,
        Err(e) => {
            tracing::debug!(target: "bigbrotr::nips::nip66", ip = %ip, error = %e, "geo_geoip_lookup_error");
            return result;
        }
    };

    let english = |names: &Option<std::collections::BTreeMap<&str, &str>>| {
        names
            .as_ref()
            .and_then(|n| n.get("en"))
            .map(|s| (*s).to_string())
    };

    // Prefer the physical country; fall back to the registered country
    let country_code = city
        .country
        .as_ref()
        .and_then(|c| c.iso_code)
        .or_else(|| city.registered_country.as_ref().and_then(|c| c.iso_code));
    if let Some(code) = country_code {
        result.insert("geo_country".to_string(), code.into());
    }
    let country_name = city
        .country
        .as_ref()
        .and_then(|c| english(&c.names))
        .or_else(|| city.registered_country.as_ref().and_then(|c| english(&c.names)));
    if let Some(name) = country_name {
        result.insert("geo_country_name".to_string(), name.into());
    }
    if let Some(is_eu) = city.country.as_ref().and_then(|c| c.is_in_european_union) {
        result.insert("geo_is_eu".to_string(), is_eu.into());
    }

    if let Some(continent) = &city.continent {
        if let Some(code) = continent.code {
            result.insert("geo_continent".to_string(), code.into());
        }
        if let Some(name) = english(&continent.names) {
            result.insert("geo_continent_name".to_string(), name.into());
        }
    }

    if let Some(place) = &city.city {
        if let Some(name) = english(&place.names) {
            result.insert("geo_city".to_string(), name.into());
        }
        if let Some(id) = place.geoname_id {
            result.insert("geo_geoname_id".to_string(), i64::from(id).into());
        }
    }

    if let Some(region) = city
        .subdivisions
        .as_ref()
        .and_then(|subs| subs.last())
        .and_then(|sub| english(&sub.names))
    {
        result.insert("geo_region".to_string(), region.into());
    }

    if let Some(postal) = city.postal.as_ref().and_then(|p| p.code) {
        result.insert("geo_postal".to_string(), postal.into());
    }

    if let Some(location) = &city.location {
        if let Some(lat) = location.latitude {
            result.insert("geo_lat".to_string(), lat.into());
        }
        if let Some(lon) = location.longitude {
            result.insert("geo_lon".to_string(), lon.into());
        }
        if let Some(accuracy) = location.accuracy_radius {
            result.insert("geo_accuracy".to_string(), i64::from(accuracy).into());
        }
        if let Some(tz) = location.time_zone {
            result.insert("geo_tz".to_string(), tz.into());
        }
        if let (Some(lat), Some(lon)) = (location.latitude, location.longitude) {
            if let Ok(hash) = geohash::encode(geohash::Coord { x: lon, y: lat }, geohash_precision)
            {
                result.insert("geo_hash".to_string(), hash.into());
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geohash_precision() {
        // Known vector: Jutland, precision 9
        let hash = geohash::encode(
            geohash::Coord {
                x: 10.407439,
                y: 57.648148,
            },
            9,
        )
        .unwrap();
        assert_eq!(hash.len(), 9);
        assert!(hash.starts_with("u4pru"));
    }

    #[tokio::test]
    async fn test_open_reader_missing_file_errors() {
        let err = open_reader(Path::new("/nonexistent/GeoLite2-City.mmdb"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::BigBrotrError::GeoIp(_)));
    }
}
