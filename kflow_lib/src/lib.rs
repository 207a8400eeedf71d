pub mod decoder;
pub mod fields;
pub mod flows;
pub mod metrics;
pub mod server;
pub mod settings;
pub mod sinks;
pub mod socket_stats;
pub mod sql;
pub mod templates;
pub mod time;
pub mod utils;


/////////////////////////////////////////////
//// EXAMPLE OF RUNNING THE COLLECTOR IN YOUR CODE
////
//
// let settings = Settings::load(Path::new("config.ini"))?;
//
// //templates are shared by every worker, last writer wins
// let templates = Arc::new(TemplateStore::new());
// let decoder = Arc::new(IpfixDecoder::new(Arc::clone(&templates)));
// let sink = Arc::new(PooledFlowSink::from_settings(&settings.sink)?);
//
// let mut server = IpfixServer::new(settings.server.clone(), decoder.clone(), sink.clone());
// server.start()?;
//
// let telemetry = Telemetry::new(Arc::clone(decoder.metrics()), templates)
//     .with_socket_stats(server.socket_stats())
//     .with_sink(Arc::clone(sink.metrics()));
// println!("{}", serde_json::to_string(&telemetry.snapshot())?);
//
// //stop receiving first, then flush what is queued
// server.stop();
// sink.close()?;
//
/////////////////////////////////////////////
////
//// CHECK SQL RS FOR FUNCTIONS THAT READ FLOWS BACK FROM THE DB
////
/////////////////////////////////////////////
