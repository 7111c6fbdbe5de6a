pub mod step_1_indicator_engine;
pub mod step_2_scaler;
pub mod step_3_window_builder;
pub mod step_4_recurrent_cell;
pub mod step_5_sequence_model;
pub mod step_6_train_model;
pub mod step_7_forecast;
pub mod step_8_model_serialization;
