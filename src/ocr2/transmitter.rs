//! Report submission to a cosmwasm OCR2 contract

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::reader::OCR2Reader;
use super::{AttributedOnchainSignature, ConfigDigest, ContractTransmitter, ReportContext};
use crate::error::{RelayerError, RelayerResult};
use crate::tx::{CosmosMsg, MsgEnqueuer, MsgExecuteContract};

#[derive(Debug, Serialize)]
struct TransmitMsg {
    transmit: TransmitPayload,
}

#[derive(Debug, Serialize)]
struct TransmitPayload {
    report_context: String,
    report: String,
    signatures: Vec<String>,
}

/// Report context as the contract expects it: three 32-byte words holding
/// the digest, the epoch and round, and the extra hash
pub fn raw_report_context(ctx: &ReportContext) -> [u8; 96] {
    let mut raw = [0u8; 96];
    raw[..32].copy_from_slice(ctx.config_digest.as_bytes());
    raw[59..63].copy_from_slice(&ctx.epoch.to_be_bytes());
    raw[63] = ctx.round;
    raw[64..].copy_from_slice(&ctx.extra_hash);
    raw
}

/// Queues `transmit` executions of one contract from one sender
pub struct CosmwasmTransmitter {
    reader: OCR2Reader,
    contract: String,
    sender: String,
    enqueuer: Arc<dyn MsgEnqueuer>,
}

impl CosmwasmTransmitter {
    pub fn new(
        reader: OCR2Reader,
        contract: impl Into<String>,
        sender: impl Into<String>,
        enqueuer: Arc<dyn MsgEnqueuer>,
    ) -> Self {
        Self {
            reader,
            contract: contract.into(),
            sender: sender.into(),
            enqueuer,
        }
    }

    fn transmit_msg(
        &self,
        report_context: &ReportContext,
        report: &[u8],
        signatures: &[AttributedOnchainSignature],
    ) -> RelayerResult<CosmosMsg> {
        let payload = TransmitMsg {
            transmit: TransmitPayload {
                report_context: BASE64.encode(raw_report_context(report_context)),
                report: BASE64.encode(report),
                signatures: signatures
                    .iter()
                    .map(|s| BASE64.encode(&s.signature))
                    .collect(),
            },
        };
        let msg = serde_json::to_vec(&payload)
            .map_err(|e| RelayerError::Codec(format!("failed to encode transmit msg: {}", e)))?;

        Ok(CosmosMsg::from(MsgExecuteContract {
            sender: self.sender.clone(),
            contract: self.contract.clone(),
            msg,
            funds: vec![],
        }))
    }
}

#[async_trait]
impl ContractTransmitter for CosmwasmTransmitter {
    async fn transmit(
        &self,
        report_context: &ReportContext,
        report: &[u8],
        signatures: &[AttributedOnchainSignature],
    ) -> RelayerResult<()> {
        info!(
            "Sending transmit for epoch {} round {} to {}",
            report_context.epoch, report_context.round, self.contract
        );
        let msg = self.transmit_msg(report_context, report, signatures)?;
        self.enqueuer.enqueue(&self.contract, msg.to_any()).await?;
        Ok(())
    }

    async fn latest_config_digest_and_epoch(&self) -> RelayerResult<(ConfigDigest, u32)> {
        self.reader.latest_config_digest_and_epoch().await
    }

    fn from_account(&self) -> String {
        self.sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::state::{test_orm, MsgState};
    use crate::tx::keystore::pub_to_addr;
    use crate::tx::keystore::test_keystore::test_pub_key;
    use crate::tx::msg::MSG_EXECUTE_CONTRACT_TYPE_URL;
    use crate::tx::AnyMsg;
    use mockall::mock;

    mock! {
        pub Enqueuer {}

        #[async_trait]
        impl MsgEnqueuer for Enqueuer {
            async fn enqueue(&self, contract_id: &str, msg: AnyMsg) -> RelayerResult<i64>;
        }
    }

    fn report_context() -> ReportContext {
        ReportContext {
            config_digest: ConfigDigest([0xaa; 32]),
            epoch: 0x01020304,
            round: 5,
            extra_hash: [0xbb; 32],
        }
    }

    fn signatures() -> Vec<AttributedOnchainSignature> {
        vec![
            AttributedOnchainSignature {
                signature: vec![0x01; 64],
                signer: 0,
            },
            AttributedOnchainSignature {
                signature: vec![0x02; 64],
                signer: 1,
            },
        ]
    }

    #[test]
    fn test_raw_report_context() {
        let raw = raw_report_context(&report_context());
        assert_eq!(&raw[..32], &[0xaa; 32]);
        assert_eq!(&raw[32..59], &[0u8; 27]);
        assert_eq!(&raw[59..64], &[1, 2, 3, 4, 5]);
        assert_eq!(&raw[64..], &[0xbb; 32]);
    }

    #[tokio::test]
    async fn test_transmit_enqueues_execute_msg() {
        let sender = pub_to_addr(&test_pub_key(1), "wasm").unwrap();
        let contract = pub_to_addr(&test_pub_key(7), "wasm").unwrap();

        let expected_sender = sender.clone();
        let expected_contract = contract.clone();
        let mut enqueuer = MockEnqueuer::new();
        enqueuer
            .expect_enqueue()
            .times(1)
            .withf(move |contract_id, msg| {
                contract_id == expected_contract && msg.type_url == MSG_EXECUTE_CONTRACT_TYPE_URL
            })
            .returning(move |_, any| {
                let CosmosMsg::ExecuteContract(m) = CosmosMsg::from_any(&any).unwrap() else {
                    panic!("expected execute contract msg");
                };
                assert_eq!(m.sender, expected_sender);
                assert!(m.funds.is_empty());

                let json: serde_json::Value = serde_json::from_slice(&m.msg).unwrap();
                let transmit = &json["transmit"];
                let ctx = BASE64
                    .decode(transmit["report_context"].as_str().unwrap())
                    .unwrap();
                assert_eq!(ctx.len(), 96);
                assert_eq!(
                    BASE64.decode(transmit["report"].as_str().unwrap()).unwrap(),
                    vec![0xde, 0xad]
                );
                assert_eq!(transmit["signatures"].as_array().unwrap().len(), 2);
                Ok(1)
            });

        let reader = OCR2Reader::new(contract.clone(), Arc::new(MockChain::new()));
        let transmitter = CosmwasmTransmitter::new(reader, contract, sender.clone(), Arc::new(enqueuer));

        transmitter
            .transmit(&report_context(), &[0xde, 0xad], &signatures())
            .await
            .unwrap();
        assert_eq!(transmitter.from_account(), sender);
    }

    #[tokio::test]
    async fn test_transmit_through_txm_queue() {
        use crate::chain::DecCoin;
        use crate::config::ChainConfig;
        use crate::tx::keystore::test_keystore::TestKeystore;
        use crate::tx::{FixedGasPriceEstimator, KeystoreAdapter, Txm, TxmConfig};

        let sender = pub_to_addr(&test_pub_key(1), "wasm").unwrap();
        let contract = pub_to_addr(&test_pub_key(7), "wasm").unwrap();
        let orm = test_orm(&format!("Chainlinktest-{}", uuid::Uuid::new_v4())).await;

        let cfg = ChainConfig::new("testing");
        let txm = Arc::new(Txm::new(
            TxmConfig::from(&cfg),
            orm.clone(),
            Arc::new(MockChain::new()),
            Arc::new(KeystoreAdapter::new(
                Arc::new(TestKeystore::new(vec![test_pub_key(1)])),
                "wasm",
            )),
            Arc::new(FixedGasPriceEstimator::single(DecCoin::new(
                "ucosm",
                cfg.fallback_gas_price,
            ))),
        ));

        let reader = OCR2Reader::new(contract.clone(), Arc::new(MockChain::new()));
        let transmitter = CosmwasmTransmitter::new(reader, contract.clone(), sender, txm);
        transmitter
            .transmit(&report_context(), &[0x01], &signatures())
            .await
            .unwrap();

        let msgs = orm.get_msgs_state(MsgState::Unstarted, 10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].contract_id, contract);
        assert_eq!(msgs[0].type_url, MSG_EXECUTE_CONTRACT_TYPE_URL);
    }

    #[tokio::test]
    async fn test_latest_config_digest_and_epoch() {
        let mut chain = MockChain::new();
        chain.expect_contract_state().returning(|_, _| {
            Ok(format!(
                r#"{{"scan_logs":false,"config_digest":{:?},"epoch":4}}"#,
                [1u8; 32]
            )
            .into_bytes())
        });
        let reader = OCR2Reader::new("wasm1ocr", Arc::new(chain));
        let transmitter =
            CosmwasmTransmitter::new(reader, "wasm1ocr", "wasm1sender", Arc::new(MockEnqueuer::new()));

        assert_eq!(
            transmitter.latest_config_digest_and_epoch().await.unwrap(),
            (ConfigDigest([1u8; 32]), 4)
        );
    }
}
