//! `metrics-endpoint` and `grafana-dashboard` providers

use serde_json::json;

use crate::error::Result;
use crate::model::relation::DataBag;
use crate::model::unit::UnitId;
use crate::settings::OperatorSettings;

/// Application bag for `metrics-endpoint`: node exporter and JMX exporter
/// targets on every unit.
pub fn metrics_app_bag(settings: &OperatorSettings) -> Result<DataBag> {
    let jobs = json!([{
        "metrics_path": "/metrics",
        "static_configs": [{
            "targets": [
                format!("*:{}", settings.ports.node_exporter),
                format!("*:{}", settings.ports.jmx_exporter),
            ]
        }]
    }]);
    let metadata = json!({
        "application": settings.app_name,
        "charm_name": settings.app_name,
    });

    let mut bag = DataBag::new();
    bag.insert("scrape_jobs".to_string(), serde_json::to_string(&jobs)?);
    bag.insert("scrape_metadata".to_string(), serde_json::to_string(&metadata)?);
    Ok(bag)
}

/// Unit bag for `metrics-endpoint`, telling the scraper where `*` points
pub fn metrics_unit_bag(unit: &UnitId, address: &str) -> DataBag {
    let mut bag = DataBag::new();
    bag.insert("prometheus_scrape_unit_address".to_string(), address.to_string());
    bag.insert("prometheus_scrape_unit_name".to_string(), unit.to_string());
    bag
}

fn broker_dashboard(settings: &OperatorSettings) -> serde_json::Value {
    let panel = |id: u32, title: &str, expr: &str| {
        json!({
            "id": id,
            "title": title,
            "type": "timeseries",
            "datasource": "${prometheusds}",
            "targets": [{ "expr": expr, "refId": "A" }],
        })
    };
    json!({
        "title": format!("{} brokers", settings.app_name),
        "uid": format!("{}-brokers", settings.app_name),
        "schemaVersion": 36,
        "templating": {
            "list": [{ "name": "prometheusds", "type": "datasource", "query": "prometheus" }]
        },
        "panels": [
            panel(
                1,
                "Active controllers",
                "sum(kafka_controller_kafkacontroller_activecontrollercount)"
            ),
            panel(
                2,
                "Under-replicated partitions",
                "sum(kafka_server_replicamanager_underreplicatedpartitions)"
            ),
            panel(
                3,
                "Offline partitions",
                "sum(kafka_controller_kafkacontroller_offlinepartitionscount)"
            ),
            panel(
                4,
                "Bytes in per second",
                "sum by (instance) (rate(kafka_server_brokertopicmetrics_bytesin_total[5m]))"
            ),
            panel(
                5,
                "Bytes out per second",
                "sum by (instance) (rate(kafka_server_brokertopicmetrics_bytesout_total[5m]))"
            ),
            panel(6, "Disk free", "node_filesystem_avail_bytes"),
        ],
    })
}

/// Application bag for `grafana-dashboard`
pub fn dashboard_app_bag(settings: &OperatorSettings) -> Result<DataBag> {
    let dashboard = broker_dashboard(settings);
    let payload = json!({
        "templates": {
            format!("file:{}-brokers.json", settings.app_name): {
                "charm": settings.app_name,
                "content": serde_json::to_string(&dashboard)?,
            }
        }
    });
    let mut bag = DataBag::new();
    bag.insert("dashboards".to_string(), serde_json::to_string(&payload)?);
    Ok(bag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_targets() {
        let bag = metrics_app_bag(&OperatorSettings::default()).unwrap();
        let jobs: serde_json::Value = serde_json::from_str(&bag["scrape_jobs"]).unwrap();
        assert_eq!(
            jobs[0]["static_configs"][0]["targets"],
            json!(["*:9100", "*:9101"])
        );
    }

    #[test]
    fn test_unit_bag() {
        let bag = metrics_unit_bag(&UnitId::new("kafka", 2), "10.0.0.12");
        assert_eq!(bag["prometheus_scrape_unit_name"], "kafka/2");
    }

    #[test]
    fn test_dashboard_payload() {
        let bag = dashboard_app_bag(&OperatorSettings::default()).unwrap();
        let payload: serde_json::Value = serde_json::from_str(&bag["dashboards"]).unwrap();
        let content = payload["templates"]["file:kafka-brokers.json"]["content"]
            .as_str()
            .unwrap();
        let dashboard: serde_json::Value = serde_json::from_str(content).unwrap();
        assert_eq!(dashboard["panels"].as_array().unwrap().len(), 6);
    }
}
